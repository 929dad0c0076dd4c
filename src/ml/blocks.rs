use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::{sigmoid, silu},
};

/// Conv2d（バイアス無し）+ BatchNorm
///
/// 活性化関数は呼び出し側で適用します（ReLU6 / SiLU / 線形）。
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &Device<B>,
    ) -> Self {
        let padding = (kernel_size - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);

        ConvNorm { conv, norm }
    }

    /// 1x1 畳み込み
    pub fn pointwise(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        Self::new(in_channels, out_channels, 1, 1, 1, device)
    }

    /// チャネルごとの畳み込み（groups = channels）
    pub fn depthwise(channels: usize, kernel_size: usize, stride: usize, device: &Device<B>) -> Self {
        Self::new(channels, channels, kernel_size, stride, channels, device)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        self.norm.forward(x)
    }
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// [0, 1] の NCHW 画像を ImageNet の平均・標準偏差で正規化（torchvision の学習時と同じ入力分布）
pub fn imagenet_normalize<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = input.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
    (input - mean) / std
}

pub fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn new(channels: usize, squeeze_channels: usize, device: &Device<B>) -> Self {
        SqueezeExcitation {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeeze_channels], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeeze_channels, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(input.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        // [N, C, 1, 1] をブロードキャスト
        input * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_conv_norm_stride() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::new(3, 8, 3, 2, 1, &device);
        let out = block.forward(Tensor::zeros([1, 3, 16, 16], &device));
        assert_eq!(out.dims(), [1, 8, 8, 8]);
    }

    #[test]
    fn test_depthwise_keeps_channels() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::depthwise(6, 5, 1, &device);
        let out = block.forward(Tensor::ones([2, 6, 9, 9], &device));
        assert_eq!(out.dims(), [2, 6, 9, 9]);
    }

    #[test]
    fn test_squeeze_excitation_shape() {
        let device = Default::default();
        let se = SqueezeExcitation::<TestBackend>::new(16, 4, &device);
        let out = se.forward(Tensor::ones([1, 16, 7, 7], &device));
        assert_eq!(out.dims(), [1, 16, 7, 7]);
    }

    #[test]
    fn test_imagenet_normalize_per_channel() {
        let device = Default::default();
        let out = imagenet_normalize(Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device));
        let values = out.into_data().to_vec::<f32>().unwrap();
        let expected = [
            (1.0 - 0.485) / 0.229,
            (1.0 - 0.456) / 0.224,
            (1.0 - 0.406) / 0.225,
        ];
        for (channel, chunk) in values.chunks(4).enumerate() {
            assert!(chunk.iter().all(|v| (v - expected[channel]).abs() < 1e-5));
        }
    }

    #[test]
    fn test_relu6_clamps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-3.0, 2.0, 9.0], &device);
        let values = relu6(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 2.0, 6.0]);
    }
}
