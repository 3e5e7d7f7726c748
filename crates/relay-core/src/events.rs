//! In-process notifications between the tracker, the strategy and the monitor.
//!
//! Publishers never wait on subscribers: events go through a bounded `broadcast` channel and a
//! lagging receiver simply skips ahead.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::strategy::{EmergencyContext, ProviderHealth};

const DEFAULT_CAPACITY: usize = 1024;

/// Something observable happened inside the routing core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ProvidersConfigured { providers: Vec<Arc<str>> },
    UsageRecorded { provider: Arc<str>, method: String, cu: u64 },
    CacheHit { provider: Arc<str>, method: String, saved_cu: u64 },
    ProviderSucceeded { provider: Arc<str>, latency_ms: u64 },
    ProviderFailed { provider: Arc<str>, error: String },
    HealthChanged { provider: Arc<str>, from: ProviderHealth, to: ProviderHealth },
    EmergencyChanged(EmergencyContext),
    /// `None` means every provider was reset.
    UsageReset { provider: Option<Arc<str>> },
}

impl CoreEvent {
    /// Events that change what a usage snapshot would show.
    #[must_use]
    pub fn affects_usage(&self) -> bool {
        !matches!(self, Self::ProviderSucceeded { .. })
    }
}

/// Cloneable handle to the shared event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
