#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod codec;
pub mod config;
pub mod device_map;
pub mod error;
pub mod gate;
pub mod generator;
pub mod loader;
mod loader_factory;
pub mod request;
pub mod telemetry;
mod util;

mod stable_diffusion;

pub use config::*;
pub use device_map::*;
pub use error::{GenerationError, Result};
pub use gate::{GateSnapshot, GenerationGate, Permit};
pub use generator::{GenerationMode, GenerationResult, Generator};
use image::{DynamicImage, GrayImage, RgbImage};
pub use loader::*;
pub use loader_factory::*;
pub use request::{GenerationParams, GenerationRequest, SeedMode};
pub use telemetry::{log_memory, GpuMemory, GpuTelemetry};
use serde::Serialize;
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionModel, StableDiffusionVersion};
pub(crate) use util::*;
pub use util::gpu_available;

/// Which of the three generation pipelines a backend has ready.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadedPipelines {
    pub txt2img: bool,
    pub img2img: bool,
    pub inpaint: bool,
}

impl LoadedPipelines {
    pub fn all(&self) -> bool {
        self.txt2img && self.img2img && self.inpaint
    }
}

/// A diffusion backend. Implementations may block for as long as the work takes;
/// callers are expected to run them off the async runtime.
pub trait Pipeline: Send + Sync {
    fn text_to_image(&self, params: &GenerationParams) -> anyhow::Result<Vec<DynamicImage>>;

    fn image_to_image(
        &self,
        params: &GenerationParams,
        image: &RgbImage,
    ) -> anyhow::Result<Vec<DynamicImage>>;

    /// White mask pixels are repainted, black ones are kept.
    fn inpaint(
        &self,
        params: &GenerationParams,
        image: &RgbImage,
        mask: &GrayImage,
    ) -> anyhow::Result<Vec<DynamicImage>>;

    /// Human readable device label, e.g. `cuda:0`.
    fn device(&self) -> String;

    fn loaded(&self) -> LoadedPipelines;

    /// Release whatever accelerator memory can be released between generations.
    fn clear_cache(&self) {}
}
