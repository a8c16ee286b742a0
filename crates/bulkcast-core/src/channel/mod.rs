//! Channel adapters - The transport that actually delivers a message

mod http;

pub use http::HttpChannelAdapter;

use async_trait::async_trait;
use bulkcast_storage::models::{FailureKind, Recipient};
use tracing::info;

/// Result of handing one message to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the channel
    Delivered { provider_message_id: Option<String> },
    /// Not delivered, with a classified reason
    Failed { kind: FailureKind, reason: String },
}

impl SendOutcome {
    pub fn delivered(provider_message_id: Option<String>) -> Self {
        SendOutcome::Delivered {
            provider_message_id,
        }
    }

    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        SendOutcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    /// Failure that may succeed on a later attempt
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::failed(FailureKind::Transport, reason)
    }

    /// Failure that will not succeed however often it is retried
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::failed(FailureKind::Rejected, reason)
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

/// Message transport used by the worker pool
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Wait until the channel can take another send. The worker awaits this
    /// before starting the send timeout.
    async fn acquire(&self) {}

    /// Send `message` to `recipient` and report the terminal result
    async fn send(&self, recipient: &Recipient, message: &str) -> SendOutcome;
}

/// Channel that only logs each message and reports it delivered
#[derive(Debug, Default, Clone)]
pub struct LogChannelAdapter;

impl LogChannelAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelAdapter for LogChannelAdapter {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, recipient: &Recipient, message: &str) -> SendOutcome {
        info!(
            recipient_id = %recipient.id,
            address = %recipient.address,
            length = message.len(),
            "Message handed to log channel"
        );
        SendOutcome::delivered(Some(format!("log.{}", uuid::Uuid::new_v4())))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// One recorded send
    #[derive(Debug, Clone)]
    pub struct SentMessage {
        pub address: String,
        pub message: String,
        pub at: Instant,
    }

    /// Channel returning scripted outcomes per address, recording every send
    pub struct ScriptedChannel {
        default: SendOutcome,
        scripts: Mutex<HashMap<String, Vec<SendOutcome>>>,
        delay: Duration,
        sent: Mutex<Vec<SentMessage>>,
    }

    impl ScriptedChannel {
        pub fn delivering() -> Self {
            Self::with_default(SendOutcome::delivered(None))
        }

        pub fn failing(kind: FailureKind) -> Self {
            Self::with_default(SendOutcome::failed(kind, kind.to_string()))
        }

        pub fn with_default(default: SendOutcome) -> Self {
            Self {
                default,
                scripts: Mutex::new(HashMap::new()),
                delay: Duration::ZERO,
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Outcomes returned for `address` in order, then the default
        pub fn script(self, address: &str, outcomes: Vec<SendOutcome>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(address.to_string(), outcomes);
            self
        }

        /// Time each send takes
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_to(&self, address: &str) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.address == address)
                .count()
        }

        /// Addresses grouped by the instant they were sent at
        pub fn batches(&self) -> Vec<Vec<String>> {
            let mut batches: Vec<(Instant, Vec<String>)> = Vec::new();
            for sent in self.sent() {
                match batches.iter_mut().find(|(at, _)| *at == sent.at) {
                    Some((_, addresses)) => addresses.push(sent.address),
                    None => batches.push((sent.at, vec![sent.address])),
                }
            }
            batches.sort_by_key(|(at, _)| *at);
            batches
                .into_iter()
                .map(|(_, mut addresses)| {
                    addresses.sort();
                    addresses
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, recipient: &Recipient, message: &str) -> SendOutcome {
            self.sent.lock().unwrap().push(SentMessage {
                address: recipient.address.clone(),
                message: message.to_string(),
                at: Instant::now(),
            });

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let scripted = {
                let mut scripts = self.scripts.lock().unwrap();
                scripts.get_mut(&recipient.address).and_then(|outcomes| {
                    if outcomes.is_empty() {
                        None
                    } else {
                        Some(outcomes.remove(0))
                    }
                })
            };
            scripted.unwrap_or_else(|| self.default.clone())
        }
    }
}
