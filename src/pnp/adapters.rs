//! Regional style adapters and their mask blending.
use crate::models::unet_2d::UNet2DConditionModel;
use crate::utils::require_file;
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// A LoRA adapted copy of the base UNet, the region where its prediction is used and the
/// `[unconditional, conditional]` embedding of its style prompt.
#[derive(Debug)]
pub struct StyleAdapter {
    pub unet: UNet2DConditionModel,
    /// Float mask in `[0, 1]`, shaped `(1, 1, latent height, latent width)`.
    pub mask: Tensor,
    pub text_embeddings: Tensor,
}

impl StyleAdapter {
    pub fn new(unet: UNet2DConditionModel, mask: Tensor, text_embeddings: Tensor) -> Self {
        Self { unet, mask, text_embeddings }
    }

    /// Blends this adapter's prediction into the running prediction.
    pub fn blend(&self, prediction: &Tensor, adapter_prediction: &Tensor) -> Tensor {
        blend(prediction, adapter_prediction, &self.mask)
    }
}

/// `base * (1 - mask) + adapter * mask`, per spatial location. Applied adapter after
/// adapter, so where masks overlap the last adapter wins.
pub fn blend(base: &Tensor, adapter: &Tensor, mask: &Tensor) -> Tensor {
    base * (1. - mask) + adapter * mask
}

/// Reads a mask image as luma, resizes it bilinearly to the latent resolution and scales
/// it to `[0, 1]`.
pub fn load_mask<P: AsRef<Path>>(path: P, height: i64, width: i64, device: Device) -> anyhow::Result<Tensor> {
    let path = require_file("mask", path)?;
    let mask = image::open(&path)?.to_luma8();
    let mask = image::imageops::resize(
        &mask,
        width as u32,
        height as u32,
        image::imageops::FilterType::Triangle,
    );
    let mask = Tensor::from_slice(mask.as_raw()).view((1, 1, height, width)).to_kind(Kind::Float) / 255.;
    Ok(mask.to(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_one_masks() {
        let opts = (Kind::Float, Device::Cpu);
        let base = Tensor::randn([3, 4, 8, 8], opts);
        let adapter = Tensor::randn([3, 4, 8, 8], opts);
        let zeros = Tensor::zeros([1, 1, 8, 8], opts);
        let ones = Tensor::ones([1, 1, 8, 8], opts);
        assert!(blend(&base, &adapter, &zeros).equal(&base));
        assert!(blend(&base, &adapter, &ones).equal(&adapter));
    }

    #[test]
    fn later_adapters_win_on_overlap() {
        let opts = (Kind::Float, Device::Cpu);
        let base = Tensor::zeros([3, 1, 2, 2], opts);
        let first = Tensor::ones([3, 1, 2, 2], opts);
        let second = Tensor::ones([3, 1, 2, 2], opts) * 2.;
        let left = Tensor::from_slice(&[1f32, 0., 1., 0.]).view((1, 1, 2, 2));
        let all = Tensor::ones([1, 1, 2, 2], opts);
        let xs = blend(&blend(&base, &first, &all), &second, &left);
        let values = Vec::<f32>::try_from(xs.get(0).view(-1)).unwrap();
        assert_eq!(values, [2., 1., 2., 1.]);
    }

    #[test]
    fn masks_are_resized_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let mut mask = image::GrayImage::new(32, 32);
        for (x, _y, pixel) in mask.enumerate_pixels_mut() {
            *pixel = image::Luma([if x < 16 { 255 } else { 0 }]);
        }
        mask.save(&path).unwrap();
        let mask = load_mask(&path, 8, 8, Device::Cpu).unwrap();
        assert_eq!(mask.size(), [1, 1, 8, 8]);
        assert_eq!(mask.double_value(&[0, 0, 3, 0]), 1.);
        assert_eq!(mask.double_value(&[0, 0, 3, 7]), 0.);
        assert!(mask.max().double_value(&[]) <= 1.);
    }
}
