use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kiln_core::{DeviceMap, GenerationDefaults, PipelineConfig};

use crate::tunnel::TunnelConfig;

/// Where and how the HTTP listener runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body limit in bytes.
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            body_limit: 32 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation server")]
pub struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "KILN_CPU")]
    pub cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, env = "KILN_DEVICE", default_value_t = 0)]
    pub device: usize,

    /// Model to serve txt2img and img2img from
    #[arg(
        long,
        env = "KILN_MODEL",
        default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5"
    )]
    pub model: String,

    /// Inpainting model; the inpaint endpoint fails without one
    #[arg(long, env = "KILN_INPAINT_MODEL")]
    pub inpaint_model: Option<String>,

    /// Load half precision weights on accelerators
    #[arg(long, env = "KILN_F16", default_value_t = true, action = ArgAction::Set)]
    pub f16: bool,

    /// Attention slice size, trades speed for memory
    #[arg(long, env = "KILN_ATTENTION_SLICE")]
    pub attention_slice: Option<usize>,

    /// Host address to bind the server to
    #[arg(long, env = "KILN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "KILN_PORT", default_value_t = 5000)]
    pub port: u16,

    #[arg(long, env = "KILN_DEFAULT_STEPS", default_value_t = 20)]
    pub default_steps: usize,

    #[arg(long, env = "KILN_DEFAULT_CFG_SCALE", default_value_t = 7.5)]
    pub default_cfg_scale: f64,

    #[arg(long, env = "KILN_DEFAULT_WIDTH", default_value_t = 512)]
    pub default_width: usize,

    #[arg(long, env = "KILN_DEFAULT_HEIGHT", default_value_t = 512)]
    pub default_height: usize,

    /// Upper bound for batch_size
    #[arg(long, env = "KILN_MAX_BATCH_SIZE", default_value_t = 4)]
    pub max_batch_size: usize,

    /// Upper bound for steps, at most 1000
    #[arg(long, env = "KILN_MAX_STEPS", default_value_t = 150)]
    pub max_steps: usize,

    /// Upper bound for width and height
    #[arg(long, env = "KILN_MAX_DIMENSION", default_value_t = 2048)]
    pub max_dimension: usize,

    /// Clear accelerator caches after every generation
    #[arg(long, env = "KILN_CLEAR_CACHE", default_value_t = true, action = ArgAction::Set)]
    pub clear_cache: bool,

    /// Maximum request body size in MiB
    #[arg(long, env = "KILN_BODY_LIMIT_MB", default_value_t = 32)]
    pub body_limit_mb: usize,

    /// Tunnel binary to launch once the server is listening (e.g. /usr/local/bin/cloudflared)
    #[arg(long, env = "KILN_TUNNEL_BIN")]
    pub tunnel_bin: Option<PathBuf>,

    /// Seconds to wait for the tunnel to report its public URL
    #[arg(long, env = "KILN_TUNNEL_TIMEOUT", default_value_t = 20)]
    pub tunnel_timeout: u64,

    /// Write the public tunnel URL to this file
    #[arg(long, env = "KILN_TUNNEL_URL_FILE")]
    pub tunnel_url_file: Option<PathBuf>,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::new(self.cpu, self.device)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            model_id: self.model.clone(),
            inpaint_model_id: self.inpaint_model.clone(),
            use_f16: self.f16,
            sliced_attention_size: self.attention_slice,
        }
    }

    pub fn generation_defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            steps: self.default_steps,
            cfg_scale: self.default_cfg_scale,
            width: self.default_width,
            height: self.default_height,
            max_batch_size: self.max_batch_size,
            max_steps: self.max_steps,
            max_dimension: self.max_dimension,
            clear_cache_after_generation: self.clear_cache,
            ..GenerationDefaults::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            body_limit: self.body_limit_mb * 1024 * 1024,
        }
    }

    pub fn tunnel_config(&self, port: u16) -> Option<TunnelConfig> {
        self.tunnel_bin.as_ref().map(|binary| TunnelConfig {
            binary: binary.clone(),
            local_url: format!("http://127.0.0.1:{port}"),
            timeout: Duration::from_secs(self.tunnel_timeout),
            url_file: self.tunnel_url_file.clone(),
        })
    }
}
