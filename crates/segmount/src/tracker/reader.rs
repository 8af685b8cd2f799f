use std::io::SeekFrom;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{SessionKey, StreamTracker};
use crate::error::{Error, Result};
use crate::vfile::VirtualFile;

/// A [`VirtualFile`] whose reads are attributed to a tracker entry.
///
/// The entry's cancellation token drives every fetch, so killing the entry makes the
/// next (or in-flight) read fail with [`Error::Cancelled`]. The entry is removed on
/// [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct TrackedReader {
    file: VirtualFile,
    tracker: StreamTracker,
    id: String,
    cancel: CancellationToken,
    closed: bool,
}

impl TrackedReader {
    pub fn new(file: VirtualFile, tracker: &StreamTracker, key: SessionKey) -> Self {
        let cancel = file.cancel_token().child_token();
        let file = file.with_cancel(cancel.clone());
        let id = tracker.add(key, file.size(), cancel.clone());
        tracker.set_offset(&id, file.position());
        Self {
            file,
            tracker: tracker.clone(),
            id,
            cancel,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn file(&self) -> &VirtualFile {
        &self.file
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_live()?;
        let n = self.file.read(buf).await?;
        if n > 0 {
            self.tracker.update_progress(&self.id, n as u64);
            self.tracker.set_offset(&self.id, self.file.position());
            self.tracker
                .update_buffered_offset(&self.id, self.buffered_end(self.file.position()));
        }
        Ok(n)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_live()?;
        let offset = self.file.seek(pos)?;
        self.tracker.set_offset(&self.id, offset);
        Ok(offset)
    }

    /// Range read for range-request adapters. Reports the range end as the new offset.
    pub async fn read_range(&mut self, start: u64, end: u64) -> Result<Bytes> {
        self.ensure_live()?;
        let data = self.file.read_range(start, end).await?;
        let reached = start + data.len() as u64;
        self.tracker.update_progress(&self.id, data.len() as u64);
        self.tracker.set_offset(&self.id, reached);
        self.tracker
            .update_buffered_offset(&self.id, self.buffered_end(reached));
        Ok(data)
    }

    /// Ends the session; the entry moves to history as completed.
    pub fn close(mut self) {
        self.finish();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.closed || self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    // End of the segment holding the last delivered byte; segments are fetched whole.
    fn buffered_end(&self, position: u64) -> u64 {
        let meta = self.file.metadata();
        position
            .checked_sub(1)
            .and_then(|last| meta.segment_index_at(last))
            .map(|idx| meta.segments[idx].end_offset)
            .unwrap_or(position)
    }

    fn finish(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tracker.remove(&self.id);
        }
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.finish();
    }
}
