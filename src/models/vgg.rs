//! VGG-19 feature extractor used for the perceptual style loss.
//!
//! Only the convolutional `features` stack is built, with the torchvision layer indexes
//! so that converted torchvision weights (`features.<i>.weight`, `features.<i>.bias`)
//! load directly.
use std::collections::BTreeMap;
use tch::{nn, Tensor};

// Channels per conv layer, `None` is a 2x2 max-pool.
const VGG19_LAYERS: [Option<i64>; 21] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

#[derive(Debug)]
enum Layer {
    Conv(nn::Conv2D),
    Relu,
    MaxPool,
}

#[derive(Debug)]
pub struct Vgg19Features {
    layers: Vec<Layer>,
}

impl Vgg19Features {
    pub fn new(vs: nn::Path) -> Self {
        let vs = &vs / "features";
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let mut layers = vec![];
        let mut c_in = 3;
        for c_out in VGG19_LAYERS {
            match c_out {
                Some(c_out) => {
                    let index = layers.len();
                    layers.push(Layer::Conv(nn::conv2d(&vs / index, c_in, c_out, 3, conv_cfg)));
                    layers.push(Layer::Relu);
                    c_in = c_out
                }
                None => layers.push(Layer::MaxPool),
            }
        }
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs the stack on `xs` and returns the outputs of the requested layer indexes.
    /// Layers past the deepest requested one are not evaluated.
    pub fn features(&self, xs: &Tensor, layers: &[usize]) -> BTreeMap<usize, Tensor> {
        let mut outputs = BTreeMap::new();
        let last = match layers.iter().max() {
            None => return outputs,
            Some(&last) => last,
        };
        let mut xs = xs.shallow_clone();
        for (index, layer) in self.layers.iter().enumerate().take(last + 1) {
            xs = match layer {
                Layer::Conv(conv) => xs.apply(conv),
                Layer::Relu => xs.relu(),
                Layer::MaxPool => xs.max_pool2d_default(2),
            };
            if layers.contains(&index) {
                outputs.insert(index, xs.shallow_clone());
            }
        }
        outputs
    }
}
