use std::sync::Arc;

use kiln_core::{Generator, GpuTelemetry};

// Application state shared by every handler.
pub struct AppState {
    pub generator: Arc<Generator>,
    pub telemetry: Arc<dyn GpuTelemetry>,
}

impl AppState {
    pub fn new(generator: Generator, telemetry: Arc<dyn GpuTelemetry>) -> Self {
        Self {
            generator: Arc::new(generator),
            telemetry,
        }
    }
}
