/// Schedulers cannot take more inference steps than the model was trained with.
pub const MAX_TRAIN_TIMESTEPS: usize = 1000;

/// Defaults applied to missing request fields, and the limits every request is clamped to.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub steps: usize,
    pub cfg_scale: f64,
    pub width: usize,
    pub height: usize,
    /// Negative means a fresh random seed per request.
    pub seed: i64,
    pub batch_size: usize,
    pub strength: f64,
    pub max_batch_size: usize,
    /// Capped at [`MAX_TRAIN_TIMESTEPS`].
    pub max_steps: usize,
    pub max_dimension: usize,
    pub clear_cache_after_generation: bool,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: 20,
            cfg_scale: 7.5,
            width: 512,
            height: 512,
            seed: -1,
            batch_size: 1,
            strength: 0.8,
            max_batch_size: 4,
            max_steps: 150,
            max_dimension: 2048,
            clear_cache_after_generation: true,
        }
    }
}

/// Which weights to load and how.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model_id: String,
    /// A 9-channel inpainting UNet. Without it the inpaint pipeline stays unloaded.
    pub inpaint_model_id: Option<String>,
    pub use_f16: bool,
    pub sliced_attention_size: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_id: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
            inpaint_model_id: None,
            use_f16: true,
            sliced_attention_size: None,
        }
    }
}
