use anyhow::{Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use rand::{distributions::Distribution, rngs::StdRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{tensor_to_image, GenerationParams};

pub(super) const VAE_SCALE: f64 = 0.18215;

/// Stacks unconditional (negative prompt) and conditional embeddings for guidance.
pub(super) fn text_embeddings(
    tokenizer: &Tokenizer,
    text_model: &ClipTextTransformer,
    sd_config: &StableDiffusionConfig,
    params: &GenerationParams,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let vocab = tokenizer.get_vocab(true);
    let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
    let pad_id = *vocab
        .get(pad_token)
        .ok_or_else(|| Error::msg(format!("tokenizer has no {pad_token} token")))?;
    let max_len = sd_config.clip.max_position_embeddings;

    let encode = |text: &str| -> Result<Tensor> {
        let mut tokens = tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(max_len);
        tokens.resize(max_len, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(text_model.forward(&tokens)?)
    };

    let cond = encode(&params.prompt)?;
    let uncond = encode(&params.negative_prompt)?;
    Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(dtype)?)
}

/// Standard normal noise drawn from `rng`, so a seed reproduces the same latents on any device.
pub(super) fn seeded_noise(
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let values: Vec<f32> = StandardNormal.sample_iter(rng).take(len).collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}

/// First timestep index to run for a given strength. Text-to-image starts at 0.
pub(super) fn start_step(steps: usize, strength: Option<f64>) -> usize {
    match strength {
        Some(strength) => {
            let skipped = steps - (steps as f64 * strength) as usize;
            skipped.min(steps.saturating_sub(1))
        }
        None => 0,
    }
}

/// Latent inputs for inpainting: the mask at latent resolution and the encoded masked image.
pub(super) struct InpaintLatents {
    pub mask: Tensor,
    pub masked_image: Tensor,
}

pub(super) struct Denoise<'a> {
    pub unet: &'a UNet2DConditionModel,
    pub sd_config: &'a StableDiffusionConfig,
    pub text_embeddings: &'a Tensor,
    pub init_latents: Option<&'a Tensor>,
    pub inpaint: Option<&'a InpaintLatents>,
}

impl Denoise<'_> {
    pub fn run(
        &self,
        params: &GenerationParams,
        rng: &mut StdRng,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_shape = (1, 4, params.height / 8, params.width / 8);
        let noise = seeded_noise(rng, latent_shape, device, dtype)?;

        let t_start = start_step(
            timesteps.len(),
            self.init_latents.map(|_| params.strength),
        );
        let mut latents = match self.init_latents {
            Some(init) => scheduler.add_noise(init, noise, timesteps[t_start])?,
            None => (noise * scheduler.init_noise_sigma())?,
        };

        // Guidance runs the unconditional and conditional passes as one batch of two.
        let inpaint = match self.inpaint {
            Some(inpaint) => Some((
                Tensor::cat(&[&inpaint.mask, &inpaint.mask], 0)?,
                Tensor::cat(&[&inpaint.masked_image, &inpaint.masked_image], 0)?,
            )),
            None => None,
        };

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let input = match &inpaint {
                Some((mask, masked_image)) => Tensor::cat(&[&input, mask, masked_image], 1)?,
                None => input,
            };

            let noise_pred = self
                .unet
                .forward(&input, timestep as f64, self.text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&noise_pred[0], &noise_pred[1]);
            let guided = (uncond + ((cond - uncond)? * params.cfg_scale)?)?;

            latents = scheduler.step(&guided, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising step");
        }
        Ok(latents)
    }
}

pub(super) fn decode_latents(vae: &AutoEncoderKL, latents: &Tensor) -> Result<DynamicImage> {
    let decoded = vae.decode(&(latents / VAE_SCALE)?)?;
    let decoded = ((decoded / 2.)? + 0.5)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?;
    let img = (decoded.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}
