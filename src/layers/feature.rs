/// 1-D convolutional feature extractor for vibration signals
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Dropout, Linear, VarBuilder};

const CONV1_CHANNELS: usize = 16;
const CONV2_CHANNELS: usize = 32;

/// Two strided convolutions, global average pooling over time and a
/// projection to `out_dim` features
///
/// Input `[batch, in_channels, seq_len]`, output `[batch, out_dim]`.
pub struct FeatureExtractor {
    conv1: Conv1d,
    conv2: Conv1d,
    proj: Linear,
    dropout: Dropout,
    out_dim: usize,
}

impl FeatureExtractor {
    pub fn new(in_channels: usize, out_dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv1d(
            in_channels,
            CONV1_CHANNELS,
            7,
            Conv1dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = conv1d(
            CONV1_CHANNELS,
            CONV2_CHANNELS,
            5,
            Conv1dConfig {
                padding: 2,
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let proj = linear(CONV2_CHANNELS, out_dim, vb.pp("proj"))?;

        Ok(Self {
            conv1,
            conv2,
            proj,
            dropout: Dropout::new(dropout),
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl ModuleT for FeatureExtractor {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        // Global average pooling over time
        let xs = xs.mean(2)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.proj.forward(&xs)?.relu()
    }
}
