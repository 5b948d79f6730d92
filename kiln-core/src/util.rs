use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, DeviceLocation, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::warn;

use crate::DeviceMap;

/// Whether this build can drive a GPU at all.
pub fn gpu_available() -> bool {
    cuda_is_available() || metal_is_available()
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an RGB image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(img: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let tensor = Tensor::from_vec(
        img.as_raw().clone(),
        (height as usize, width as usize, 3),
        &Device::Cpu,
    )?
    .permute((2, 0, 1))?
    .to_dtype(DType::F32)?
    .affine(2. / 255., -1.)?
    .unsqueeze(0)?;
    Ok(tensor.to_dtype(dtype)?.to_device(device)?)
}

/// Converts a mask into a (1, 1, height, width) tensor of zeros and ones.
pub fn mask_to_tensor(mask: &GrayImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = mask.dimensions();
    let values: Vec<f32> = mask
        .as_raw()
        .iter()
        .map(|&v| if v >= 128 { 1.0 } else { 0.0 })
        .collect();
    let tensor = Tensor::from_vec(values, (1, 1, height as usize, width as usize), &Device::Cpu)?;
    Ok(tensor.to_dtype(dtype)?.to_device(device)?)
}
