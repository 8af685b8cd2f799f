//! Provider pool: failover, retries, concurrency caps, connection reuse, lifecycle and
//! speed tests, all against the in-memory article network.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use tokio_util::sync::CancellationToken;

use segmount::{EngineSettings, Error, ProviderPool, SegmentInfo};

mod pool_fixture;
mod setup;

use pool_fixture::{ArticleNetwork, fast_settings, pattern, pool, provider};

const ID: &str = "part1@news.test";

fn groups() -> Vec<String> {
    vec!["alt.binaries.test".to_string()]
}

fn two_providers(network: &ArticleNetwork) -> ProviderPool {
    pool(
        network,
        vec![provider("primary", 0, 2), provider("backup", 1, 2)],
        fast_settings(),
    )
}

#[tokio::test(start_paused = true)]
async fn missing_article_fails_over_to_next_provider() {
    setup::init_tracing();
    let network = ArticleNetwork::new();
    network.insert("backup", ID, pattern(64, 3));
    let pool = two_providers(&network);

    let body = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap();

    assert_eq!(&body[..], &pattern(64, 3)[..]);
    // A definitive miss is not retried.
    assert_eq!(network.body_calls("primary"), 1);
    assert_eq!(network.body_calls("backup"), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_on_the_same_provider() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(32, 1));
    network.insert("backup", ID, pattern(32, 2));
    network.fail_next("primary", 2);
    let pool = two_providers(&network);

    let body = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap();

    assert_eq!(&body[..], &pattern(32, 1)[..]);
    assert_eq!(network.body_calls("primary"), 3);
    assert_eq!(network.body_calls("backup"), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_fail_over_to_next_provider() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(32, 1));
    network.insert("backup", ID, pattern(32, 2));
    network.fail_next("primary", 100);
    let pool = two_providers(&network);

    let body = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap();

    assert_eq!(&body[..], &pattern(32, 2)[..]);
    // One attempt plus `max_retries_per_provider` retries.
    let attempts = fast_settings().max_retries_per_provider as usize + 1;
    assert_eq!(network.body_calls("primary"), attempts);
}

#[tokio::test(start_paused = true)]
async fn missing_everywhere_is_segment_unavailable() {
    let network = ArticleNetwork::new();
    let pool = two_providers(&network);

    let err = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap_err();

    assert!(
        matches!(&err, Error::SegmentUnavailable { remote_id, .. } if remote_id == ID),
        "unexpected error: {err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn missing_on_one_and_broken_on_other_is_segment_unavailable() {
    let network = ArticleNetwork::new();
    network.refuse_connections("backup", true);
    let pool = two_providers(&network);

    let err = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap_err();

    match err {
        Error::SegmentUnavailable { reason, .. } => {
            assert!(reason.contains("missing on 1 provider"), "reason: {reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn connection_failures_everywhere_exhaust_providers() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(8, 0));
    network.refuse_connections("primary", true);
    network.refuse_connections("backup", true);
    let pool = two_providers(&network);

    let err = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AllProvidersExhausted { .. }), "{err:?}");
    assert!(err.is_segment_failure());
}

#[tokio::test]
async fn pool_without_providers_is_exhausted() {
    let network = ArticleNetwork::new();
    let pool = pool(&network, vec![], fast_settings());

    let err = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AllProvidersExhausted { .. }));
    assert_eq!(pool.in_flight_capacity(), 0);
}

#[rstest]
#[case(vec![("c", 5), ("a", -1), ("b", 0)], vec!["a", "b", "c"])]
#[case(vec![("only", 3)], vec!["only"])]
fn providers_are_ordered_by_priority(
    #[case] input: Vec<(&str, i32)>,
    #[case] expected: Vec<&str>,
) {
    let network = ArticleNetwork::new();
    let configs = input
        .into_iter()
        .map(|(id, prio)| provider(id, prio, 1))
        .collect();
    let pool = pool(&network, configs, fast_settings());

    let ids: Vec<String> = pool.providers().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_provider_cap() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    network.set_delay("primary", Duration::from_millis(100));
    let pool = pool(
        &network,
        vec![provider("primary", 0, 2), provider("backup", 1, 1)],
        fast_settings(),
    );
    assert_eq!(pool.in_flight_capacity(), 3);

    let handles: Vec<_> = (0..10)
        .map(|_| pool.fetch_segment_async(CancellationToken::new(), ID, groups()))
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(network.max_in_flight(), 2);
    assert_eq!(network.body_calls("primary"), 10);
    assert!(network.connects("primary") <= 2);
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_reused() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    let pool = two_providers(&network);
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        pool.fetch_segment_bytes(&cancel, ID, &groups()).await.unwrap();
    }

    assert_eq!(network.connects("primary"), 1);
    assert_eq!(pool.idle_connections("primary"), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_idle_connections_are_closed_not_reused() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    let settings = fast_settings().connection_idle_timeout(Duration::from_secs(1));
    let pool = pool(&network, vec![provider("primary", 0, 2)], settings);
    let cancel = CancellationToken::new();

    pool.fetch_segment_bytes(&cancel, ID, &groups()).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    pool.fetch_segment_bytes(&cancel, ID, &groups()).await.unwrap();

    assert_eq!(network.connects("primary"), 2);
    assert_eq!(network.closed("primary"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connection_is_not_returned_to_idle() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    network.fail_next("primary", 1);
    let pool = pool(&network, vec![provider("primary", 0, 1)], fast_settings());

    pool.fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap();

    assert_eq!(network.connects("primary"), 2);
    assert_eq!(pool.idle_connections("primary"), 1);
}

#[tokio::test(start_paused = true)]
async fn quit_closes_idle_connections_and_rejects_new_requests() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    network.insert("backup", ID, pattern(16, 0));
    let pool = two_providers(&network);
    let cancel = CancellationToken::new();
    pool.fetch_segment_bytes(&cancel, ID, &groups()).await.unwrap();

    pool.quit().await;

    assert!(pool.is_closed());
    assert_eq!(network.closed("primary"), 1);
    assert_eq!(pool.idle_connections("primary"), 0);
    let err = pool.fetch_segment_bytes(&cancel, ID, &groups()).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_a_slow_fetch() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    network.set_delay("primary", Duration::from_secs(20));
    let pool = two_providers(&network);
    let cancel = CancellationToken::new();

    let handle = pool.fetch_segment_async(cancel.clone(), ID, groups());
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let err = handle.await.unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    // Cancellation does not fail over.
    assert_eq!(network.body_calls("backup"), 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_fetch_handle_reports_cancelled() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 0));
    network.set_delay("primary", Duration::from_secs(20));
    let pool = two_providers(&network);

    let handle = pool.fetch_segment_async(CancellationToken::new(), ID, groups());
    handle.abort();

    assert!(matches!(handle.await, Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out_and_fails_over() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(16, 1));
    network.insert("backup", ID, pattern(16, 2));
    network.set_delay("primary", Duration::from_secs(60));
    let settings = fast_settings()
        .request_timeout(Duration::from_secs(1))
        .max_retries_per_provider(0);
    let pool = pool(
        &network,
        vec![provider("primary", 0, 2), provider("backup", 1, 2)],
        settings,
    );

    let body = pool
        .fetch_segment_bytes(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap();
    assert_eq!(&body[..], &pattern(16, 2)[..]);
}

#[tokio::test(start_paused = true)]
async fn stat_reports_presence_with_failover() {
    let network = ArticleNetwork::new();
    network.insert("backup", ID, pattern(4, 0));
    let pool = two_providers(&network);
    let cancel = CancellationToken::new();

    assert!(pool.stat_segment(&cancel, ID, &groups()).await.unwrap());
    assert!(!pool.stat_segment(&cancel, "other@news.test", &groups()).await.unwrap());
    assert_eq!(network.body_calls("backup"), 0);
    assert_eq!(network.stat_calls("primary"), 2);

    let spawned = pool.stat_segment_async(cancel.clone(), ID, groups());
    assert!(spawned.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn stat_with_every_provider_down_is_an_error() {
    let network = ArticleNetwork::new();
    network.refuse_connections("primary", true);
    network.refuse_connections("backup", true);
    let pool = two_providers(&network);

    let err = pool
        .stat_segment(&CancellationToken::new(), ID, &groups())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AllProvidersExhausted { .. }));
}

#[tokio::test(start_paused = true)]
async fn fetch_segment_writes_into_sink() {
    let network = ArticleNetwork::new();
    network.insert("primary", ID, pattern(100, 9));
    let pool = two_providers(&network);

    let mut sink: Vec<u8> = Vec::new();
    let written = pool
        .fetch_segment(&CancellationToken::new(), ID, &groups(), &mut sink)
        .await
        .unwrap();

    assert_eq!(written, 100);
    assert_eq!(sink, pattern(100, 9));
}

fn speed_test_segments(count: usize, size: u64) -> Vec<SegmentInfo> {
    SegmentInfo::layout((0..count).map(|i| (format!("speed-{i}@news.test"), groups(), size)))
}

#[tokio::test(start_paused = true)]
async fn speed_test_records_throughput_on_provider() {
    let network = ArticleNetwork::new();
    let segments = speed_test_segments(4, 1_000);
    for seg in &segments {
        network.insert("primary", &seg.remote_id, pattern(1_000, 0));
    }
    network.set_delay("primary", Duration::from_millis(100));
    let pool = two_providers(&network);

    let result = pool
        .speed_test("primary", &segments, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.provider_id, "primary");
    assert_eq!(result.bytes, 4_000);
    assert_eq!(result.segments_ok, 4);
    assert_eq!(result.segments_failed, 0);
    assert!(!result.timed_out);
    assert!(result.mbps > 0.0);
    // Two connections, four 100ms fetches.
    assert!(result.elapsed >= Duration::from_millis(200));

    let recorded = pool.provider("primary").unwrap();
    assert_eq!(recorded.last_speed_test_mbps, Some(result.mbps));
    assert!(recorded.last_speed_test_time.is_some());
    assert!(pool.provider("backup").unwrap().last_speed_test_mbps.is_none());
    // Speed tests never touch other providers.
    assert_eq!(network.body_calls("backup"), 0);
}

#[tokio::test(start_paused = true)]
async fn speed_test_with_nothing_fetched_reports_zero() {
    let network = ArticleNetwork::new();
    let pool = two_providers(&network);

    let result = pool
        .speed_test("primary", &speed_test_segments(3, 500), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.bytes, 0);
    assert_eq!(result.segments_failed, 3);
    assert_eq!(result.mbps, 0.0);
    assert_eq!(pool.provider("primary").unwrap().last_speed_test_mbps, Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn speed_test_stops_at_time_budget() {
    let network = ArticleNetwork::new();
    let segments = speed_test_segments(2, 500);
    for seg in &segments {
        network.insert("primary", &seg.remote_id, pattern(500, 0));
    }
    network.set_delay("primary", Duration::from_secs(30));
    let settings = fast_settings()
        .speed_test_budget(Duration::from_secs(2))
        .request_timeout(Duration::from_secs(60));
    let pool = pool(&network, vec![provider("primary", 0, 4)], settings);

    let result = pool
        .speed_test("primary", &segments, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.bytes, 0);
    assert_eq!(result.mbps, 0.0);
}

#[tokio::test]
async fn speed_test_for_unknown_provider_is_not_found() {
    let network = ArticleNetwork::new();
    let pool = two_providers(&network);

    let err = pool
        .speed_test("nope", &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn pool_shares_settings_by_reference() {
    let network = ArticleNetwork::new();
    let settings = Arc::new(EngineSettings::default().max_retries_per_provider(7));
    let pool = ProviderPool::new(vec![provider("p", 0, 3)], network.connector(), settings);
    assert_eq!(pool.in_flight_capacity(), 3);
    assert_eq!(pool.in_flight(), 0);
}
