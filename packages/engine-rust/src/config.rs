use chrono::FixedOffset;
use quarry_core::clock::utc;

/// Engine-level configuration for the decorator stack.
///
/// Controls fallback diagnostics and operation instrumentation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Log a warning whenever a filter is evaluated by scanning the whole
    /// collection in memory.
    pub warn_on_full_scan: bool,
    /// Wrap every collection of the stack in an `info_span!` per operation.
    pub instrument: bool,
    /// Timezone used when a filter carries none and the caller is unknown.
    pub default_timezone: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warn_on_full_scan: true,
            instrument: true,
            default_timezone: utc(),
        }
    }
}
