//! Encoder, decoder and metric networks.
//!
//! The model treats its three sub-networks as black boxes with a shape contract:
//! - encoder: `[n, D] -> (mu [n, d], log_var [n, d])`
//! - decoder: `[n, d] -> [n, D]`, values in `(0, 1)`
//! - metric: `[n, D] -> L [n, d, d]`, lower triangular with a positive diagonal
//!
//! Custom networks are described by a [`NetworkConfig`] so that they can be
//! persisted next to the model weights and rebuilt on load.

use crate::linalg;
use burn::config::Config;
use burn::module::Module;
use burn::nn::{
    Linear, LinearConfig, PaddingConfig2d,
    conv::{Conv2d, Conv2dConfig},
};
use burn::tensor::{Tensor, activation, backend::Backend};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The slot a network fills inside the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkRole {
    Encoder,
    Decoder,
    Metric,
}

impl NetworkRole {
    /// Stem of the descriptor file persisted for a custom network.
    pub fn artifact_stem(&self) -> &'static str {
        match self {
            Self::Encoder => "encoder",
            Self::Decoder => "decoder",
            Self::Metric => "metric",
        }
    }
}

impl fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.artifact_stem())
    }
}

/// Output of an encoder: parameters of the Gaussian posterior `q(z|x)`.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    pub embedding: Tensor<B, 2>,
    pub log_covariance: Tensor<B, 2>,
}

fn mlp_layers<B: Backend>(input: usize, hidden: &[usize], device: &B::Device) -> Vec<Linear<B>> {
    let mut layers = Vec::with_capacity(hidden.len());
    let mut width = input;
    for &h in hidden {
        layers.push(LinearConfig::new(width, h).init(device));
        width = h;
    }
    layers
}

fn mlp_forward<B: Backend>(layers: &[Linear<B>], mut x: Tensor<B, 2>) -> Tensor<B, 2> {
    for layer in layers {
        x = activation::relu(layer.forward(x));
    }
    x
}

fn image_shape(input_dim: &[usize]) -> Option<[usize; 3]> {
    match input_dim {
        [c, h, w] => Some([*c, *h, *w]),
        [h, w] => Some([1, *h, *w]),
        _ => None,
    }
}

fn conv_layers<B: Backend>(
    in_channels: usize,
    channels: &[usize],
    device: &B::Device,
) -> Vec<Conv2d<B>> {
    let mut layers = Vec::with_capacity(channels.len());
    let mut width = in_channels;
    for &c in channels {
        layers.push(
            Conv2dConfig::new([width, c], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        );
        width = c;
    }
    layers
}

// --------------------------------------------------------------------------
// Encoders
// --------------------------------------------------------------------------

/// Configuration for the fully connected encoder
#[derive(Config, Debug)]
pub struct MlpEncoderConfig {
    /// Shape of one data point
    pub input_dim: Vec<usize>,
    /// Latent dimension
    pub latent_dim: usize,
    /// Hidden layer widths
    #[config(default = "vec![512]")]
    pub hidden_dims: Vec<usize>,
}

impl MlpEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpEncoder<B> {
        let input: usize = self.input_dim.iter().product();
        let last = self.hidden_dims.last().copied().unwrap_or(input);
        MlpEncoder {
            hidden: mlp_layers(input, &self.hidden_dims, device),
            embedding: LinearConfig::new(last, self.latent_dim).init(device),
            log_var: LinearConfig::new(last, self.latent_dim).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct MlpEncoder<B: Backend> {
    pub hidden: Vec<Linear<B>>,
    pub embedding: Linear<B>,
    pub log_var: Linear<B>,
}

impl<B: Backend> MlpEncoder<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> EncoderOutput<B> {
        let h = mlp_forward(&self.hidden, x);
        EncoderOutput {
            embedding: self.embedding.forward(h.clone()),
            log_covariance: self.log_var.forward(h),
        }
    }
}

/// Configuration for the convolutional encoder, for `[C, H, W]` or `[H, W]` data
#[derive(Config, Debug)]
pub struct ConvEncoderConfig {
    /// Shape of one data point
    pub input_dim: Vec<usize>,
    /// Latent dimension
    pub latent_dim: usize,
    /// Output channels of the convolution stack
    #[config(default = "vec![16, 32]")]
    pub channels: Vec<usize>,
}

impl ConvEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Option<ConvEncoder<B>> {
        let [c, h, w] = image_shape(&self.input_dim)?;
        let last = self.channels.last().copied().unwrap_or(c);
        Some(ConvEncoder {
            convs: conv_layers(c, &self.channels, device),
            embedding: LinearConfig::new(last * h * w, self.latent_dim).init(device),
            log_var: LinearConfig::new(last * h * w, self.latent_dim).init(device),
            channels: c,
            height: h,
            width: w,
        })
    }
}

#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pub embedding: Linear<B>,
    pub log_var: Linear<B>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl<B: Backend> ConvEncoder<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> EncoderOutput<B> {
        let [n, _] = x.dims();
        let mut h = x.reshape([n, self.channels, self.height, self.width]);
        for conv in &self.convs {
            h = activation::relu(conv.forward(h));
        }
        let h: Tensor<B, 2> = h.flatten(1, 3);
        EncoderOutput {
            embedding: self.embedding.forward(h.clone()),
            log_covariance: self.log_var.forward(h),
        }
    }
}

#[derive(Module, Debug)]
pub enum Encoder<B: Backend> {
    Mlp(MlpEncoder<B>),
    Conv(ConvEncoder<B>),
}

impl<B: Backend> Encoder<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> EncoderOutput<B> {
        match self {
            Self::Mlp(net) => net.forward(x),
            Self::Conv(net) => net.forward(x),
        }
    }
}

// --------------------------------------------------------------------------
// Decoders
// --------------------------------------------------------------------------

/// Configuration for the fully connected decoder
#[derive(Config, Debug)]
pub struct MlpDecoderConfig {
    /// Shape of one data point
    pub input_dim: Vec<usize>,
    /// Latent dimension
    pub latent_dim: usize,
    /// Hidden layer widths
    #[config(default = "vec![512]")]
    pub hidden_dims: Vec<usize>,
}

impl MlpDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpDecoder<B> {
        let output: usize = self.input_dim.iter().product();
        let last = self.hidden_dims.last().copied().unwrap_or(self.latent_dim);
        MlpDecoder {
            hidden: mlp_layers(self.latent_dim, &self.hidden_dims, device),
            reconstruction: LinearConfig::new(last, output).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct MlpDecoder<B: Backend> {
    pub hidden: Vec<Linear<B>>,
    pub reconstruction: Linear<B>,
}

impl<B: Backend> MlpDecoder<B> {
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = mlp_forward(&self.hidden, z);
        activation::sigmoid(self.reconstruction.forward(h))
    }
}

/// Configuration for the convolutional decoder, mirror of [`ConvEncoderConfig`]
#[derive(Config, Debug)]
pub struct ConvDecoderConfig {
    /// Shape of one data point
    pub input_dim: Vec<usize>,
    /// Latent dimension
    pub latent_dim: usize,
    /// Channels of the convolution stack, before the final projection to the data channels
    #[config(default = "vec![32, 16]")]
    pub channels: Vec<usize>,
}

impl ConvDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Option<ConvDecoder<B>> {
        let [c, h, w] = image_shape(&self.input_dim)?;
        let first = self.channels.first().copied().unwrap_or(c);
        let mut stack: Vec<usize> = self.channels.iter().skip(1).copied().collect();
        stack.push(c);
        Some(ConvDecoder {
            projection: LinearConfig::new(self.latent_dim, first * h * w).init(device),
            convs: conv_layers(first, &stack, device),
            start_channels: first,
            height: h,
            width: w,
        })
    }
}

#[derive(Module, Debug)]
pub struct ConvDecoder<B: Backend> {
    pub projection: Linear<B>,
    pub convs: Vec<Conv2d<B>>,
    pub start_channels: usize,
    pub height: usize,
    pub width: usize,
}

impl<B: Backend> ConvDecoder<B> {
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, _] = z.dims();
        let mut h = activation::relu(self.projection.forward(z)).reshape([
            n,
            self.start_channels,
            self.height,
            self.width,
        ]);
        let last = self.convs.len().saturating_sub(1);
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(h);
            if i < last {
                h = activation::relu(h);
            }
        }
        activation::sigmoid(h.flatten(1, 3))
    }
}

#[derive(Module, Debug)]
pub enum Decoder<B: Backend> {
    Mlp(MlpDecoder<B>),
    Conv(ConvDecoder<B>),
}

impl<B: Backend> Decoder<B> {
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Mlp(net) => net.forward(z),
            Self::Conv(net) => net.forward(z),
        }
    }
}

// --------------------------------------------------------------------------
// Metric
// --------------------------------------------------------------------------

/// Configuration for the metric network producing the local factors `L`
#[derive(Config, Debug)]
pub struct MetricNetworkConfig {
    /// Shape of one data point
    pub input_dim: Vec<usize>,
    /// Latent dimension
    pub latent_dim: usize,
    /// Hidden layer widths
    #[config(default = "vec![400]")]
    pub hidden_dims: Vec<usize>,
}

impl MetricNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MetricNetwork<B> {
        let input: usize = self.input_dim.iter().product();
        let last = self.hidden_dims.last().copied().unwrap_or(input);
        let n_lower = self.latent_dim * (self.latent_dim - 1) / 2;
        MetricNetwork {
            hidden: mlp_layers(input, &self.hidden_dims, device),
            diag: LinearConfig::new(last, self.latent_dim).init(device),
            lower: (n_lower > 0).then(|| LinearConfig::new(last, n_lower).init(device)),
        }
    }
}

#[derive(Module, Debug)]
pub struct MetricNetwork<B: Backend> {
    pub hidden: Vec<Linear<B>>,
    /// Log of the diagonal of L
    pub diag: Linear<B>,
    /// Strictly lower part of L, absent when the latent space is one dimensional
    pub lower: Option<Linear<B>>,
}

impl<B: Backend> MetricNetwork<B> {
    /// Lower triangular factors `L` of shape `[n, d, d]`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 3> {
        let h = mlp_forward(&self.hidden, x);
        let diagonal = self.diag.forward(h.clone()).exp();
        let lower = self.lower.as_ref().map(|layer| layer.forward(h));
        linalg::lower_triangular(diagonal, lower)
    }
}

// --------------------------------------------------------------------------
// Descriptors
// --------------------------------------------------------------------------

/// Serializable description of a network, used to inject custom architectures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "architecture", rename_all = "snake_case")]
pub enum NetworkConfig {
    MlpEncoder(MlpEncoderConfig),
    ConvEncoder(ConvEncoderConfig),
    MlpDecoder(MlpDecoderConfig),
    ConvDecoder(ConvDecoderConfig),
    MlpMetric(MetricNetworkConfig),
}

impl NetworkConfig {
    pub fn role(&self) -> NetworkRole {
        match self {
            Self::MlpEncoder(_) | Self::ConvEncoder(_) => NetworkRole::Encoder,
            Self::MlpDecoder(_) | Self::ConvDecoder(_) => NetworkRole::Decoder,
            Self::MlpMetric(_) => NetworkRole::Metric,
        }
    }

    pub fn input_dim(&self) -> &[usize] {
        match self {
            Self::MlpEncoder(c) => &c.input_dim,
            Self::ConvEncoder(c) => &c.input_dim,
            Self::MlpDecoder(c) => &c.input_dim,
            Self::ConvDecoder(c) => &c.input_dim,
            Self::MlpMetric(c) => &c.input_dim,
        }
    }

    pub fn latent_dim(&self) -> usize {
        match self {
            Self::MlpEncoder(c) => c.latent_dim,
            Self::ConvEncoder(c) => c.latent_dim,
            Self::MlpDecoder(c) => c.latent_dim,
            Self::ConvDecoder(c) => c.latent_dim,
            Self::MlpMetric(c) => c.latent_dim,
        }
    }

    /// Whether the input shape fits the architecture.
    pub fn supports_input(&self) -> bool {
        let dims = self.input_dim();
        match self {
            Self::ConvEncoder(_) | Self::ConvDecoder(_) => image_shape(dims).is_some(),
            _ => !dims.is_empty(),
        }
    }

    pub(crate) fn init_encoder<B: Backend>(&self, device: &B::Device) -> Option<Encoder<B>> {
        match self {
            Self::MlpEncoder(c) => Some(Encoder::Mlp(c.init(device))),
            Self::ConvEncoder(c) => c.init(device).map(Encoder::Conv),
            _ => None,
        }
    }

    pub(crate) fn init_decoder<B: Backend>(&self, device: &B::Device) -> Option<Decoder<B>> {
        match self {
            Self::MlpDecoder(c) => Some(Decoder::Mlp(c.init(device))),
            Self::ConvDecoder(c) => c.init(device).map(Decoder::Conv),
            _ => None,
        }
    }

    pub(crate) fn init_metric<B: Backend>(&self, device: &B::Device) -> Option<MetricNetwork<B>> {
        match self {
            Self::MlpMetric(c) => Some(c.init(device)),
            _ => None,
        }
    }
}

impl From<MlpEncoderConfig> for NetworkConfig {
    fn from(config: MlpEncoderConfig) -> Self {
        Self::MlpEncoder(config)
    }
}

impl From<ConvEncoderConfig> for NetworkConfig {
    fn from(config: ConvEncoderConfig) -> Self {
        Self::ConvEncoder(config)
    }
}

impl From<MlpDecoderConfig> for NetworkConfig {
    fn from(config: MlpDecoderConfig) -> Self {
        Self::MlpDecoder(config)
    }
}

impl From<ConvDecoderConfig> for NetworkConfig {
    fn from(config: ConvDecoderConfig) -> Self {
        Self::ConvDecoder(config)
    }
}

impl From<MetricNetworkConfig> for NetworkConfig {
    fn from(config: MetricNetworkConfig) -> Self {
        Self::MlpMetric(config)
    }
}
