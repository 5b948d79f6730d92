use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod encoder;
mod sampling;

use crate::{
    device_label, image_to_tensor, loader_factory::ModelVariant, mask_to_tensor,
    select_best_device, DeviceMap, GenerationParams, LoadedPipelines, Loader, Pipeline,
    PipelineConfig,
};
use encoder::LatentEncoder;
use sampling::{Denoise, InpaintLatents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        // Width and height here only size the reference latents; requests pick their own.
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
        }
    }
}

fn weights_file(component: &str, stem: &str, use_f16: bool) -> String {
    if use_f16 {
        format!("{component}/{stem}.fp16.safetensors")
    } else {
        format!("{component}/{stem}.safetensors")
    }
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    latent_encoder: LatentEncoder,
    unet: UNet2DConditionModel,
    inpaint_unet: Option<UNet2DConditionModel>,
    // Serializes accelerator work, including calls that outlive an interrupt.
    run_lock: Mutex<()>,
}

impl StableDiffusionModel {
    fn generate(
        &self,
        params: &GenerationParams,
        source: Option<&RgbImage>,
        mask: Option<&GrayImage>,
    ) -> Result<Vec<DynamicImage>> {
        let _running = self.run_lock.lock();
        let unet = match mask {
            Some(_) => self
                .inpaint_unet
                .as_ref()
                .context("inpaint pipeline is not loaded, start the server with --inpaint-model")?,
            None => &self.unet,
        };
        let (width, height) = (params.width as u32, params.height as u32);

        let text_embeddings = sampling::text_embeddings(
            &self.tokenizer,
            &self.text_model,
            &self.sd_config,
            params,
            &self.device,
            self.dtype,
        )?;

        let source = match source {
            Some(source) => {
                let resized =
                    image::imageops::resize(source, width, height, FilterType::CatmullRom);
                Some(image_to_tensor(&resized, &self.device, self.dtype)?)
            }
            None => None,
        };
        let init_latents = match &source {
            Some(source) => Some(self.latent_encoder.encode(source)?),
            None => None,
        };
        let inpaint = match (mask, &source) {
            (Some(mask), Some(source)) => {
                let full = image::imageops::resize(mask, width, height, FilterType::Nearest);
                let full = mask_to_tensor(&full, &self.device, self.dtype)?;
                let latent =
                    image::imageops::resize(mask, width / 8, height / 8, FilterType::Nearest);
                let latent = mask_to_tensor(&latent, &self.device, self.dtype)?;
                // Keep only the pixels outside the mask.
                let masked = source.broadcast_mul(&full.affine(-1., 1.)?)?;
                Some(InpaintLatents {
                    mask: latent,
                    masked_image: self.latent_encoder.encode(&masked)?,
                })
            }
            _ => None,
        };

        let denoise = Denoise {
            unet,
            sd_config: &self.sd_config,
            text_embeddings: &text_embeddings,
            init_latents: init_latents.as_ref(),
            inpaint: inpaint.as_ref(),
        };

        let base_seed = params.seed.resolve();
        let mut images = Vec::with_capacity(params.batch_size);
        for index in 0..params.batch_size {
            let seed = base_seed.wrapping_add(index as u64);
            if !self.device.is_cpu() {
                self.device.set_seed(seed)?;
            }
            let mut rng = StdRng::seed_from_u64(seed);
            let latents = denoise.run(params, &mut rng, &self.device, self.dtype)?;
            images.push(sampling::decode_latents(&self.vae, &latents)?);
            debug!(seed, image = index + 1, of = params.batch_size, "decoded image");
        }
        Ok(images)
    }
}

impl Pipeline for StableDiffusionModel {
    fn text_to_image(&self, params: &GenerationParams) -> Result<Vec<DynamicImage>> {
        self.generate(params, None, None)
    }

    fn image_to_image(
        &self,
        params: &GenerationParams,
        image: &RgbImage,
    ) -> Result<Vec<DynamicImage>> {
        self.generate(params, Some(image), None)
    }

    fn inpaint(
        &self,
        params: &GenerationParams,
        image: &RgbImage,
        mask: &GrayImage,
    ) -> Result<Vec<DynamicImage>> {
        self.generate(params, Some(image), Some(mask))
    }

    fn device(&self) -> String {
        device_label(&self.device)
    }

    fn loaded(&self) -> LoadedPipelines {
        LoadedPipelines {
            txt2img: true,
            img2img: true,
            inpaint: self.inpaint_unet.is_some(),
        }
    }

    fn clear_cache(&self) {
        // Skip while an interrupted call still owns the device.
        let Some(_idle) = self.run_lock.try_lock() else {
            debug!("pipeline still running, cache left as is");
            return;
        };
        match self.device.synchronize() {
            Ok(()) => info!("Memory cleared"),
            Err(e) => debug!("device synchronize failed: {e}"),
        }
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(
        variant: ModelVariant,
        config: PipelineConfig,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(version) = variant;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let use_f16 = config.use_f16 && !device.is_cpu();
        let dtype = if use_f16 { DType::F16 } else { DType::F32 };
        let use_flash_attn = cfg!(feature = "flash-attn");
        let sd_config = version.config(config.sliced_attention_size);
        info!("Device: {}, data type: {:?}", device_label(&device), dtype);

        let repo = api.model(config.model_id.clone());

        // --- Load CLIP text encoder and tokenizer ---
        let clip_file = repo
            .get(&weights_file("text_encoder", "model", use_f16))
            .await
            .context("failed to get CLIP weights")?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_file,
            &device,
            DType::F32,
        )
        .context("failed to load CLIP text encoder")?;
        let tokenizer_file = api
            .model(version.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load VAE ---
        let vae_file = repo
            .get(&weights_file("vae", "diffusion_pytorch_model", use_f16))
            .await
            .context("failed to get VAE weights")?;
        let vae = sd_config
            .build_vae(&vae_file, &device, dtype)
            .context("failed to load VAE")?;
        let vae_vb = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_file], dtype, &device)? };
        let latent_encoder = LatentEncoder::new(vae_vb).context("failed to load VAE encoder")?;

        // --- Load UNet ---
        let unet_file = repo
            .get(&weights_file("unet", "diffusion_pytorch_model", use_f16))
            .await
            .context("failed to get UNet weights")?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, use_flash_attn, dtype)
            .context("failed to load UNet")?;
        info!("txt2img and img2img pipelines loaded");

        // --- Load the inpainting UNet (latents + mask + masked image latents) ---
        let inpaint_unet = match &config.inpaint_model_id {
            Some(model_id) => {
                let file = api
                    .model(model_id.clone())
                    .get(&weights_file("unet", "diffusion_pytorch_model", use_f16))
                    .await
                    .context("failed to get inpainting UNet weights")?;
                let unet = sd_config
                    .build_unet(file, &device, 9, use_flash_attn, dtype)
                    .context("failed to load inpainting UNet")?;
                info!("inpaint pipeline loaded from {model_id}");
                Some(unet)
            }
            None => None,
        };

        Ok(StableDiffusionModel {
            device,
            dtype,
            sd_config,
            tokenizer,
            text_model,
            vae,
            latent_encoder,
            unet,
            inpaint_unet,
            run_lock: Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_half_precision_weight_files() {
        assert_eq!(
            weights_file("unet", "diffusion_pytorch_model", true),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
        assert_eq!(
            weights_file("text_encoder", "model", false),
            "text_encoder/model.safetensors"
        );
    }

    #[test]
    fn configs_pad_prompts_to_the_clip_context() {
        let config = StableDiffusionVersion::V1_5.config(None);
        assert_eq!(config.clip.max_position_embeddings, 77);
        assert!(config.clip.pad_with.is_none());
        let config = StableDiffusionVersion::V2_1.config(Some(1));
        assert_eq!(config.clip.pad_with.as_deref(), Some("!"));
    }
}
