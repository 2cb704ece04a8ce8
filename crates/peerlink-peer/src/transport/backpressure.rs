//! Send-side flow control for data channels
//!
//! Some backends only queue on send; the webrtc data channel hands SCTP
//! payloads to its association without blocking. Senders wait here until
//! the queued byte count drops under a high-water mark before handing over
//! the next message, so a file is never read faster than the link drains.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::TransportError;

/// Queued bytes above which senders pause (4 MB)
pub const BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct SendWindow {
    pub high_water: usize,
    pub poll_interval: Duration,
    /// Stop waiting and send anyway after this long
    pub max_wait: Duration,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self {
            high_water: BUFFERED_AMOUNT_HIGH,
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl SendWindow {
    /// Wait until a message of `next` bytes fits under the high-water mark.
    ///
    /// `buffered` reports the channel's queued byte count, or `None` once
    /// the channel is no longer open. A message larger than the window is
    /// let through as soon as the queue is empty.
    pub async fn reserve<F, Fut>(&self, next: usize, mut buffered: F) -> Result<(), TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<usize>>,
    {
        let fits = |queued: usize| queued == 0 || queued.saturating_add(next) <= self.high_water;

        let queued = buffered().await.ok_or(TransportError::ChannelNotOpen)?;
        if fits(queued) {
            return Ok(());
        }
        debug!(
            "Applying backpressure: {} bytes queued, next message {} bytes",
            queued, next
        );

        let deadline = Instant::now() + self.max_wait;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let queued = buffered().await.ok_or(TransportError::ChannelNotOpen)?;
            if fits(queued) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Send buffer did not drain within {:?} ({} bytes queued), sending anyway",
                    self.max_wait, queued
                );
                return Ok(());
            }
        }
    }
}
