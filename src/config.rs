use std::thread;

use typed_builder::TypedBuilder;

/// Incoming queues larger than this many bytes are spilled by the default
/// queue policy; outgoing queue sets are spilled when their total size is
/// larger than this times the number of queues.
pub const DEFAULT_QUEUE_THRESHOLD: usize = 4096;

/// Communicate cycles run after each block in a non-blocking exchange.
pub const DEFAULT_MAX_RECV_TRIES: usize = 1;

/// Largest message sent as a single transfer.
pub const MAX_MESSAGE_SIZE: usize = i32::MAX as usize;

/// Tunables of a [`Master`](crate::Master).
///
/// ```
/// use strata::MasterConfig;
///
/// let config = MasterConfig::builder().threads(2).limit(4).build();
/// assert_eq!(config.worker_threads(), 2);
/// assert_eq!(config.limit, Some(4));
/// assert!(config.immediate);
/// ```
#[derive(Clone, Debug, TypedBuilder)]
pub struct MasterConfig {
    /// Worker threads used to run block callbacks. Defaults to the
    /// hardware concurrency.
    #[builder(default, setter(strip_option))]
    pub threads: Option<usize>,
    /// Most blocks allowed in memory at once. Unlimited if unset.
    #[builder(default, setter(strip_option))]
    pub limit: Option<usize>,
    /// Messages above this size are split into pieces.
    #[builder(default = MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
    #[builder(default = DEFAULT_MAX_RECV_TRIES)]
    pub max_recv_tries: usize,
    /// Run `foreach` callbacks as soon as they are registered, instead of
    /// batching them until the next `execute` or `exchange`.
    #[builder(default = true)]
    pub immediate: bool,
}

impl MasterConfig {
    /// Number of worker threads, resolving the hardware default.
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            thread::available_parallelism().map_or(1, |n| n.get())
        })
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
