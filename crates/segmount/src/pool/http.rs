//! Article-gateway connector over HTTP.
//!
//! Convention: `GET {scheme}://{host}:{port}/article/{remote_id}` returns the segment body,
//! `HEAD` on the same URL probes existence. `404` is a definitive miss. The groups a
//! segment was posted to travel in the `X-Article-Groups` header (comma separated).

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, StatusCode};
use url::Url;

use super::connection::{Connection, Connector};
use crate::error::{Error, Result};
use crate::model::ProviderConfig;

const GROUPS_HEADER: &str = "X-Article-Groups";

/// [`Connector`] backed by a shared `reqwest` client.
///
/// The client does its own keep-alive pooling; each [`Connection`] handed to the pool is a
/// cheap view bound to one provider's base URL and credentials.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, provider: &ProviderConfig) -> Result<Box<dyn Connection>> {
        let scheme = if provider.tls { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{}:{}/", provider.host, provider.port))
            .map_err(|e| {
                Error::connection(&provider.id, format!("invalid provider address: {e}"))
            })?;

        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            provider_id: provider.id.clone(),
            base,
            username: provider.username.clone(),
            password: provider.password.clone(),
        }))
    }
}

struct HttpConnection {
    client: Client,
    provider_id: String,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl HttpConnection {
    fn article_url(&self, remote_id: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::connection(&self.provider_id, "provider URL cannot be a base"))?
            .clear()
            .push("article")
            .push(remote_id);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        remote_id: &str,
        groups: &[String],
    ) -> Result<reqwest::Response> {
        let url = self.article_url(remote_id)?;
        let mut req = self.client.request(method, url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        if !groups.is_empty() {
            req = req.header(GROUPS_HEADER, groups.join(","));
        }

        req.send()
            .await
            .map_err(|e| Error::connection(&self.provider_id, e.to_string()))
    }

    fn check_status(&self, remote_id: &str, resp: &reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::ArticleNotFound {
                provider: self.provider_id.clone(),
                remote_id: remote_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::HttpError {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn body(&mut self, remote_id: &str, groups: &[String]) -> Result<Bytes> {
        let resp = self.send(Method::GET, remote_id, groups).await?;
        self.check_status(remote_id, &resp)?;
        resp.bytes()
            .await
            .map_err(|e| Error::connection(&self.provider_id, format!("body read failed: {e}")))
    }

    async fn stat(&mut self, remote_id: &str, groups: &[String]) -> Result<bool> {
        let resp = self.send(Method::HEAD, remote_id, groups).await?;
        match self.check_status(remote_id, &resp) {
            Ok(()) => Ok(true),
            Err(Error::ArticleNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
