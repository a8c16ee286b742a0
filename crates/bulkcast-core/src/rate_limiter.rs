//! Rate Limiter - Controls the send rate of a channel

use crate::channel::{ChannelAdapter, SendOutcome};
use async_trait::async_trait;
use bulkcast_storage::models::Recipient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    used: u32,
}

/// Channel wrapper allowing at most `per_minute` sends per fixed one-minute
/// window, shared by every campaign using the channel. Over budget,
/// `acquire` waits for the next window; `send` itself never waits.
pub struct RateLimitedChannel {
    inner: Arc<dyn ChannelAdapter>,
    per_minute: u32,
    window: Mutex<Window>,
}

impl RateLimitedChannel {
    pub fn new(inner: Arc<dyn ChannelAdapter>, per_minute: u32) -> Self {
        Self {
            inner,
            per_minute: per_minute.max(1),
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Wait until the current window has budget and take one slot
    async fn take_slot(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(window.started) >= WINDOW {
                    window.started = now;
                    window.used = 0;
                }

                if window.used < self.per_minute {
                    window.used += 1;
                    return;
                }
                (window.started + WINDOW).saturating_duration_since(now)
            };

            debug!(
                channel = self.inner.name(),
                wait_ms = wait.as_millis() as u64,
                "Rate limit hit, waiting for next window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Sends left in the current window
    pub async fn remaining(&self) -> u32 {
        let window = self.window.lock().await;
        if Instant::now().duration_since(window.started) >= WINDOW {
            self.per_minute
        } else {
            self.per_minute.saturating_sub(window.used)
        }
    }
}

#[async_trait]
impl ChannelAdapter for RateLimitedChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn acquire(&self) {
        self.take_slot().await;
        self.inner.acquire().await;
    }

    async fn send(&self, recipient: &Recipient, message: &str) -> SendOutcome {
        self.inner.send(recipient, message).await
    }
}
