use serde::Serialize;
use tracing::info;

/// Accelerator memory in GiB, as reported by the driver.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GpuMemory {
    #[serde(skip)]
    pub name: String,
    pub allocated_gb: f64,
    pub free_gb: f64,
    pub total_gb: f64,
}

/// Source of accelerator memory figures. `None` means no GPU or no way to ask.
/// Implementations may block.
pub trait GpuTelemetry: Send + Sync {
    fn query(&self) -> Option<GpuMemory>;
}

/// Logs the current figures, if there are any.
pub fn log_memory(telemetry: &dyn GpuTelemetry) {
    if let Some(memory) = telemetry.query() {
        info!(
            "GPU Memory - Allocated: {:.2}GB, Free: {:.2}GB, Total: {:.2}GB",
            memory.allocated_gb, memory.free_gb, memory.total_gb
        );
    }
}
