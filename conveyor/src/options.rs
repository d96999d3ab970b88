//! Pipeline configuration.

use serde::{Deserialize, Serialize};

/// Default capacity of each stage-to-stage hand-off channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Per-pipeline runtime options.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use conveyor::PipelineOptions;
///
/// let opts = PipelineOptions::default().with_debug(true);
/// assert_eq!(opts.channel_capacity, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Emit a debug event for every hand-off channel read and write.
    pub debug: bool,
    /// Buffer size of each hand-off channel. Zero is treated as one.
    pub channel_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            debug: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineOptions {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Capacity actually used when creating hand-off channels.
    pub(crate) fn effective_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
