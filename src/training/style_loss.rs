//! Gram matrix style loss on VGG-19 features.
use crate::models::vgg::Vgg19Features;
use std::collections::BTreeMap;
use tch::{Kind, Tensor};

/// Style layers (conv1_1 to conv5_1) and their weights.
pub const DEFAULT_STYLE_LAYERS: [(usize, f64); 5] =
    [(0, 1.0), (5, 0.75), (10, 0.2), (19, 0.2), (28, 0.2)];

/// Channel correlations of a `(1, channels, height, width)` feature map.
pub fn gram_matrix(xs: &Tensor) -> Tensor {
    let channels = xs.size()[1];
    let xs = xs.view((channels, -1));
    xs.mm(&xs.tr())
}

/// The Gram matrices of a fixed style image, compared against generated images.
#[derive(Debug)]
pub struct StyleLoss {
    layer_weights: Vec<(usize, f64)>,
    reference: BTreeMap<usize, Tensor>,
}

impl StyleLoss {
    pub fn new(vgg: &Vgg19Features, style_image: &Tensor, layer_weights: &[(usize, f64)]) -> Self {
        let layers: Vec<usize> = layer_weights.iter().map(|(l, _)| *l).collect();
        let reference = tch::no_grad(|| {
            vgg.features(style_image, &layers)
                .into_iter()
                .map(|(layer, xs)| (layer, gram_matrix(&xs)))
                .collect()
        });
        Self { layer_weights: layer_weights.to_vec(), reference }
    }

    pub fn layers(&self) -> Vec<usize> {
        self.layer_weights.iter().map(|(l, _)| *l).collect()
    }

    /// `sum_l w_l * mean((G_l - S_l)^2)` over the style layers.
    pub fn loss(&self, vgg: &Vgg19Features, image: &Tensor) -> Tensor {
        let features = vgg.features(image, &self.layers());
        let terms: Vec<Tensor> = self
            .layer_weights
            .iter()
            .map(|(layer, weight)| {
                let gram = gram_matrix(&features[layer]);
                (gram - &self.reference[layer]).square().mean(Kind::Float) * *weight
            })
            .collect();
        if terms.is_empty() {
            return Tensor::zeros([1], (Kind::Float, image.device())).sum(Kind::Float);
        }
        Tensor::stack(&terms, 0).sum(Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    #[test]
    fn gram_of_known_features() {
        let xs = Tensor::from_slice(&[1f32, 2., 3., 4.]).view((1, 2, 1, 2));
        let gram = Vec::<f32>::try_from(gram_matrix(&xs).view(-1)).unwrap();
        assert_eq!(gram, [5., 11., 11., 25.]);
    }

    #[test]
    fn style_image_has_zero_loss_against_itself() {
        let vs = nn::VarStore::new(Device::Cpu);
        let vgg = Vgg19Features::new(vs.root());
        let style = Tensor::rand([1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let weights = [(0, 1.0), (5, 0.75)];
        let style_loss = StyleLoss::new(&vgg, &style, &weights);
        assert_eq!(style_loss.layers(), [0, 5]);
        let same = tch::no_grad(|| style_loss.loss(&vgg, &style));
        assert_eq!(same.double_value(&[]), 0.);
        let other = Tensor::rand([1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let different = tch::no_grad(|| style_loss.loss(&vgg, &other));
        assert!(different.double_value(&[]) > 0.);
    }
}
