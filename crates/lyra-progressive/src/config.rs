use std::{fmt, sync::Arc};

use lyra_bufpool::{Allocator, AllocatorConfig};
use lyra_events::EventBus;
use lyra_loader::{DefaultLoadErrorHandlingPolicy, LoadErrorHandlingPolicy, LoaderConfig};

/// Bytes a load may extract before it pauses for the period.
pub const DEFAULT_CONTINUE_LOADING_CHECK_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Configuration for a [`ProgressiveMediaPeriod`](crate::ProgressiveMediaPeriod).
#[derive(Clone)]
pub struct ProgressiveConfig {
    /// Name of the period's looper; the loader threads derive theirs from it.
    pub name: String,
    pub continue_loading_check_interval_bytes: u64,
    /// Arena the period's sample queues lease from. Each period gets its own
    /// when `None`.
    pub allocator: Option<Allocator>,
    pub load_error_handling_policy: Arc<dyn LoadErrorHandlingPolicy>,
    /// Bus to publish on. A fresh one is created when `None`.
    pub bus: Option<EventBus>,
    pub event_channel_capacity: usize,
    /// Cache key for the media, overriding its uri.
    pub custom_cache_key: Option<String>,
    pub loader: LoaderConfig,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            name: "lyra-period".to_owned(),
            continue_loading_check_interval_bytes: DEFAULT_CONTINUE_LOADING_CHECK_INTERVAL_BYTES,
            allocator: None,
            load_error_handling_policy: Arc::new(DefaultLoadErrorHandlingPolicy::default()),
            bus: None,
            event_channel_capacity: 64,
            custom_cache_key: None,
            loader: LoaderConfig::default(),
        }
    }
}

impl ProgressiveConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_continue_loading_check_interval_bytes(mut self, bytes: u64) -> Self {
        self.continue_loading_check_interval_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    #[must_use]
    pub fn with_load_error_handling_policy(mut self, policy: Arc<dyn LoadErrorHandlingPolicy>) -> Self {
        self.load_error_handling_policy = policy;
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_custom_cache_key(mut self, key: impl Into<String>) -> Self {
        self.custom_cache_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub(crate) fn take_allocator(&mut self) -> Allocator {
        self.allocator
            .take()
            .unwrap_or_else(|| Allocator::new(AllocatorConfig::default()))
    }

    pub(crate) fn take_bus(&mut self) -> EventBus {
        let capacity = self.event_channel_capacity;
        self.bus.take().unwrap_or_else(|| EventBus::new(capacity))
    }
}

impl fmt::Debug for ProgressiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressiveConfig")
            .field("name", &self.name)
            .field(
                "continue_loading_check_interval_bytes",
                &self.continue_loading_check_interval_bytes,
            )
            .field("custom_cache_key", &self.custom_cache_key)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}
