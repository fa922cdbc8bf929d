use anyhow::{anyhow, Result};
use burn::{
    module::{Ignored, Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{args::ConfigError, dataset::CHANNELS, dataset::FaceItem};

const CONV1_KERNEL: usize = 7;
const CONV1_STRIDE: usize = 4;
const POOL_KERNEL: usize = 3;
const POOL_STRIDE: usize = 2;

/// Layer widths of the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GilNetConfig {
    pub conv_channels: [usize; 3],
    pub hidden_units: usize,
}

impl Default for GilNetConfig {
    fn default() -> Self {
        Self {
            conv_channels: [96, 256, 384],
            hidden_units: 512,
        }
    }
}

/// Side length of the last pooled feature map, or `None` if the input is too small.
pub fn feature_side(image_size: usize) -> Option<usize> {
    let pooled = |side: usize| side.checked_sub(POOL_KERNEL).map(|s| s / POOL_STRIDE + 1);

    let conv1 = image_size.checked_sub(CONV1_KERNEL)? / CONV1_STRIDE + 1;
    // conv2 and conv3 are padded to keep their input size.
    let side = pooled(conv1)?;
    let side = pooled(side)?;
    pooled(side)
}

pub fn minimum_image_size() -> usize {
    (CONV1_KERNEL..)
        .find(|&size| feature_side(size).is_some())
        .unwrap_or(CONV1_KERNEL)
}

impl GilNetConfig {
    pub fn init<B: Backend>(
        &self,
        num_classes: usize,
        image_size: usize,
        channel_means: Vec<f32>,
        l2_reg_lambda: f64,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<GilNet<B>> {
        let side = feature_side(image_size).ok_or(ConfigError::ImageTooSmall {
            size: image_size,
            minimum: minimum_image_size(),
        })?;
        if channel_means.len() != CHANNELS {
            return Err(anyhow!(
                "expected {} channel means, got {}",
                CHANNELS,
                channel_means.len()
            ));
        }

        let [c1, c2, c3] = self.conv_channels;
        let hidden = self.hidden_units;

        Ok(GilNet {
            conv1: conv_from_rng(rng, device, CHANNELS, c1, CONV1_KERNEL, CONV1_STRIDE, 0),
            conv2: conv_from_rng(rng, device, c1, c2, 5, 1, 2),
            conv3: conv_from_rng(rng, device, c2, c3, 3, 1, 1),
            pool: MaxPool2dConfig::new([POOL_KERNEL, POOL_KERNEL])
                .with_strides([POOL_STRIDE, POOL_STRIDE])
                .init(),
            fc6: linear_from_rng(rng, device, c3 * side * side, hidden),
            fc7: linear_from_rng(rng, device, hidden, hidden),
            fc8: linear_from_rng(rng, device, hidden, num_classes),
            channel_means: Ignored(channel_means),
            l2_reg_lambda: Ignored(l2_reg_lambda),
        })
    }
}

#[derive(Module, Debug)]
pub struct GilNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    fc6: Linear<B>,
    fc7: Linear<B>,
    fc8: Linear<B>,
    channel_means: Ignored<Vec<f32>>,
    l2_reg_lambda: Ignored<f64>,
}

impl<B: Backend> GilNet<B> {
    /// Logits for a `[batch, channels, height, width]` image tensor.
    ///
    /// Dropout is applied after both hidden fully connected layers when a
    /// sampler is given.
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        mut dropout: Option<&mut DropoutSampler>,
    ) -> Tensor<B, 2> {
        let means = Tensor::<B, 4>::from_floats(
            TensorData::new(self.channel_means.0.clone(), [1, CHANNELS, 1, 1]),
            &images.device(),
        );
        let x = images - means;

        let x = self.pool.forward(relu(self.conv1.forward(x)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
        let x = self.pool.forward(relu(self.conv3.forward(x)));
        let x: Tensor<B, 2> = x.flatten(1, 3);

        let x = apply_dropout(relu(self.fc6.forward(x)), dropout.as_deref_mut());
        let x = apply_dropout(relu(self.fc7.forward(x)), dropout.as_deref_mut());
        self.fc8.forward(x)
    }

    /// Mean cross-entropy plus `lambda * sum(w^2) / 2` over conv and fc weights.
    pub fn loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let cross_entropy = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets);

        let lambda = self.l2_reg_lambda.0;
        if lambda == 0.0 {
            return cross_entropy;
        }
        cross_entropy + self.weight_norm().mul_scalar(lambda / 2.0)
    }

    fn weight_norm(&self) -> Tensor<B, 1> {
        let squared = |w: Tensor<B, 4>| (w.clone() * w).sum();
        let squared_fc = |w: Tensor<B, 2>| (w.clone() * w).sum();

        squared(self.conv1.weight.val())
            + squared(self.conv2.weight.val())
            + squared(self.conv3.weight.val())
            + squared_fc(self.fc6.weight.val())
            + squared_fc(self.fc7.weight.val())
            + squared_fc(self.fc8.weight.val())
    }

    pub fn channel_means(&self) -> &[f32] {
        &self.channel_means.0
    }

    pub fn device(&self) -> B::Device {
        self.fc8.weight.val().device()
    }
}

/// Inverted dropout with masks drawn from a seeded host RNG.
pub struct DropoutSampler {
    keep_prob: f64,
    rng: StdRng,
}

impl DropoutSampler {
    pub fn new(keep_prob: f64, rng: StdRng) -> Self {
        Self { keep_prob, rng }
    }

    pub fn apply<B: Backend>(&mut self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.keep_prob >= 1.0 {
            return input;
        }

        let [rows, cols] = input.dims();
        let scale = (1.0 / self.keep_prob) as f32;
        let mask: Vec<f32> = (0..rows * cols)
            .map(|_| {
                if self.rng.gen::<f64>() < self.keep_prob {
                    scale
                } else {
                    0.0
                }
            })
            .collect();
        let mask =
            Tensor::<B, 2>::from_floats(TensorData::new(mask, [rows, cols]), &input.device());
        input * mask
    }
}

fn apply_dropout<B: Backend>(
    input: Tensor<B, 2>,
    dropout: Option<&mut DropoutSampler>,
) -> Tensor<B, 2> {
    match dropout {
        Some(sampler) => sampler.apply(input),
        None => input,
    }
}

/// Images and targets of one batch, moved onto a device.
pub struct FaceBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub classes: Vec<usize>,
}

impl<B: Backend> FaceBatch<B> {
    pub fn from_items(items: &[&FaceItem], image_size: usize, device: &B::Device) -> Self {
        let mut images = Vec::with_capacity(items.len() * CHANNELS * image_size * image_size);
        let mut classes = Vec::with_capacity(items.len());

        for item in items {
            images.extend(item.pixels.iter().map(|&value| f32::from(value)));
            classes.push(item.class_index());
        }

        let labels: Vec<i64> = classes.iter().map(|&class| class as i64).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images, [items.len(), CHANNELS, image_size, image_size]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_ints(TensorData::new(labels, [items.len()]), device);

        Self {
            images,
            targets,
            classes,
        }
    }
}

/// Arg-max class per row of `logits`.
pub fn predictions<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let values = logits
        .argmax(1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow!("failed to decode predictions: {err:?}"))?;
    Ok(values.into_iter().map(|value| value as usize).collect())
}

pub fn exact_match_accuracy(predictions: &[usize], targets: &[usize]) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    let hits = predictions
        .iter()
        .zip(targets)
        .filter(|(predicted, target)| predicted == target)
        .count();
    hits as f32 / targets.len() as f32
}

fn conv_from_rng<B: Backend>(
    rng: &mut StdRng,
    device: &B::Device,
    channels_in: usize,
    channels_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Conv2d<B> {
    let mut conv = Conv2dConfig::new([channels_in, channels_out], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(Initializer::Zeros)
        .init(device);

    let limit = (1.0f32 / (channels_in * kernel * kernel) as f32).sqrt();
    conv.weight = Param::from_tensor(random_tensor::<B, 4>(
        rng,
        [channels_out, channels_in, kernel, kernel],
        limit,
        device,
    ));
    conv
}

fn linear_from_rng<B: Backend>(
    rng: &mut StdRng,
    device: &B::Device,
    fan_in: usize,
    fan_out: usize,
) -> Linear<B> {
    let mut linear = LinearConfig::new(fan_in, fan_out)
        .with_initializer(Initializer::Zeros)
        .init(device);

    let limit = (1.0f32 / fan_in as f32).sqrt();
    linear.weight = Param::from_tensor(random_tensor::<B, 2>(rng, [fan_in, fan_out], limit, device));
    linear
}

fn random_tensor<B: Backend, const D: usize>(
    rng: &mut StdRng,
    shape: [usize; D],
    limit: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let total: usize = shape.iter().product();
    let values: Vec<f32> = (0..total)
        .map(|_| rng.gen::<f32>() * 2.0 * limit - limit)
        .collect();

    Tensor::<B, D>::from_floats(TensorData::new(values, shape), device)
}
