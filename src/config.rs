use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for [`System::launch`](crate::rt::System::launch).
/// Keeps the timing and placement knobs small and explicit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Loop period in nanoseconds (`None` = 1 ms).
    pub period_ns: Option<i64>,

    /// Logical CPU core to pin the RT task to (`None` = no pinning).
    pub core_id: Option<usize>,

    /// SCHED_FIFO priority for the RT task, 1..=99 (`None` = inherit
    /// the normal scheduler; the system then runs best-effort).
    pub rt_priority: Option<i32>,

    /// Lock current and future memory pages at startup. Failing is not
    /// fatal, only logged.
    #[serde(default)]
    pub lock_memory: bool,

    /// Capacity of the host-to-RT command ring (`None` = 64; rounded up
    /// to a power of two).
    pub command_capacity: Option<usize>,

    /// Capacity of the RT-to-host telemetry ring (`None` = 256; rounded
    /// up to a power of two).
    pub telemetry_capacity: Option<usize>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            period_ns: None,
            core_id: None,
            rt_priority: None,
            lock_memory: false,
            command_capacity: None,
            telemetry_capacity: None,
        }
    }
}

impl SystemConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}
