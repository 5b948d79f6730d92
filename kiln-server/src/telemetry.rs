use std::process::Command;

use kiln_core::{GpuMemory, GpuTelemetry};
use tracing::debug;

/// Reports nothing; used on CPU.
pub struct NoGpu;

impl GpuTelemetry for NoGpu {
    fn query(&self) -> Option<GpuMemory> {
        None
    }
}

/// Asks `nvidia-smi` about one device. Blocking; call it off the async runtime.
pub struct NvidiaSmi {
    pub ordinal: usize,
}

impl GpuTelemetry for NvidiaSmi {
    fn query(&self) -> Option<GpuMemory> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.used,memory.free,memory.total",
                "--format=csv,noheader,nounits",
                &format!("--id={}", self.ordinal),
            ])
            .output();
        match output {
            Ok(output) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!("nvidia-smi exited with {}", output.status);
                None
            }
            Err(e) => {
                debug!("nvidia-smi unavailable: {e}");
                None
            }
        }
    }
}

const MIB_PER_GIB: f64 = 1024.0;

/// Parses one `name, used, free, total` line, memory in MiB.
fn parse_nvidia_smi(output: &str) -> Option<GpuMemory> {
    let line = output.lines().find(|line| !line.trim().is_empty())?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, used, free, total] = fields.as_slice() else {
        return None;
    };
    let mib = |value: &str| value.parse::<f64>().ok().map(|v| v / MIB_PER_GIB);
    Some(GpuMemory {
        name: name.to_string(),
        allocated_gb: mib(*used)?,
        free_gb: mib(*free)?,
        total_gb: mib(*total)?,
    })
}
