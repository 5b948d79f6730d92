//! The encoder half of the SD autoencoder, returning the posterior mean.
//!
//! `AutoEncoderKL::encode` only hands out samples drawn from the device RNG, and that RNG
//! cannot be seeded on CPU. Conditioning latents come from here instead, so the same
//! image always encodes to the same latents.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{self as nn, Module, VarBuilder};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig,
};

use super::sampling::VAE_SCALE;

// Autoencoder layout shared by SD 1.x and 2.x.
const BLOCK_OUT_CHANNELS: [usize; 4] = [128, 256, 512, 512];
const LAYERS_PER_BLOCK: usize = 2;
const NORM_NUM_GROUPS: usize = 32;
const LATENT_CHANNELS: usize = 4;
const EPS: f64 = 1e-6;

pub(super) struct LatentEncoder {
    conv_in: nn::Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
    quant_conv: nn::Conv2d,
}

impl LatentEncoder {
    /// `vs` points at the root of the VAE weights.
    pub fn new(vs: VarBuilder) -> Result<Self> {
        let encoder = vs.pp("encoder");
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(3, BLOCK_OUT_CHANNELS[0], 3, conv_cfg, encoder.pp("conv_in"))?;

        let mut down_blocks = Vec::with_capacity(BLOCK_OUT_CHANNELS.len());
        let mut in_channels = BLOCK_OUT_CHANNELS[0];
        for (index, &out_channels) in BLOCK_OUT_CHANNELS.iter().enumerate() {
            let config = DownEncoderBlock2DConfig {
                num_layers: LAYERS_PER_BLOCK,
                resnet_eps: EPS,
                resnet_groups: NORM_NUM_GROUPS,
                add_downsample: index + 1 < BLOCK_OUT_CHANNELS.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            let block = DownEncoderBlock2D::new(
                encoder.pp("down_blocks").pp(index.to_string()),
                in_channels,
                out_channels,
                config,
            )?;
            down_blocks.push(block);
            in_channels = out_channels;
        }

        let mid_config = UNetMidBlock2DConfig {
            resnet_eps: EPS,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(NORM_NUM_GROUPS),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(encoder.pp("mid_block"), in_channels, None, mid_config)?;
        let conv_norm_out =
            nn::group_norm(NORM_NUM_GROUPS, in_channels, EPS, encoder.pp("conv_norm_out"))?;
        let conv_out = nn::conv2d(
            in_channels,
            2 * LATENT_CHANNELS,
            3,
            conv_cfg,
            encoder.pp("conv_out"),
        )?;
        let quant_conv = nn::conv2d(
            2 * LATENT_CHANNELS,
            2 * LATENT_CHANNELS,
            1,
            Default::default(),
            vs.pp("quant_conv"),
        )?;

        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    /// Scaled posterior mean for an image tensor in [-1, 1].
    pub fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(image)?;
        for block in &self.down_blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.mid_block.forward(&xs, None)?;
        let xs = nn::ops::silu(&self.conv_norm_out.forward(&xs)?)?;
        let moments = self.quant_conv.forward(&self.conv_out.forward(&xs)?)?;
        // First half of the channels is the mean, second half the log variance.
        let mean = moments.narrow(1, 0, LATENT_CHANNELS)?;
        Ok((mean * VAE_SCALE)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn same_image_encodes_to_same_latents() {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = LatentEncoder::new(vs).unwrap();

        let image = Tensor::rand(-1f32, 1f32, (1, 3, 16, 16), &Device::Cpu).unwrap();
        let first = encoder.encode(&image).unwrap();
        let second = encoder.encode(&image).unwrap();

        assert_eq!(first.dims(), &[1, LATENT_CHANNELS, 2, 2]);
        let first = first.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let second = second.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, second);
    }
}
