use std::sync::Arc;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{
    DeviceMap, Loader, Pipeline, PipelineConfig, StableDiffusionLoader, StableDiffusionVersion,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVersion),
}

impl ModelVariant {
    /// Detect model variant from a hub model id
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase().replace(['_', '.'], "-");

        if !(name_upper.contains("STABLE-DIFFUSION") || name_upper.contains("/SD-")) {
            return None;
        }
        let version = if name_upper.contains("2-1") {
            StableDiffusionVersion::V2_1
        } else {
            // v1.5 checkpoints and their fine-tunes share one layout
            StableDiffusionVersion::V1_5
        };
        Some(ModelVariant::StableDiffusion(version))
    }
}

/// Load a pipeline based on its model id, automatically detecting the appropriate loader
pub async fn load_pipeline(
    config: PipelineConfig,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn Pipeline>> {
    let model_variant = ModelVariant::from_name(&config.model_id)
        .ok_or_else(|| anyhow!("Unsupported model: {}", config.model_id))?;

    info!(
        "Loading model: {} (detected variant: {:?})",
        config.model_id, model_variant
    );

    match model_variant {
        ModelVariant::StableDiffusion(_) => {
            let model =
                StableDiffusionLoader::load(model_variant, config, api, device_map).await?;
            Ok(Arc::new(model))
        }
    }
}
