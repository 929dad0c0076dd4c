//! MobileNetV2 特徴抽出部
//!
//! torchvision の `mobilenet_v2` と同じ層構成（ReLU6、逆残差ブロック、幅倍率1.0）。
//! 入力は [-1, 1] にスケーリング済みの NCHW テンソルです。先頭で [0, 1] に戻してから
//! ImageNet 平均・標準偏差で正規化します（torchvision の重みが前提とする入力分布）。

use burn::prelude::*;

use crate::ml::blocks::{imagenet_normalize, relu6, ConvNorm};

/// 出力特徴チャネル数
pub const MOBILENET_V2_FEATURES: usize = 1280;

const STEM_CHANNELS: usize = 32;

/// (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    project: ConvNorm<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &Device<B>,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = if expand_ratio != 1 {
            Some(ConvNorm::pointwise(in_channels, hidden, device))
        } else {
            None
        };

        InvertedResidual {
            expand,
            depthwise: ConvNorm::depthwise(hidden, 3, stride, device),
            project: ConvNorm::pointwise(hidden, out_channels, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => relu6(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = relu6(self.depthwise.forward(x));
        let x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNorm<B>,
    blocks: Vec<InvertedResidual<B>>,
    head: ConvNorm<B>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn new(device: &Device<B>) -> Self {
        let stem = ConvNorm::new(3, STEM_CHANNELS, 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;
        for (expand_ratio, out_channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expand_ratio,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvNorm::pointwise(in_channels, MOBILENET_V2_FEATURES, device);

        MobileNetV2 { stem, blocks, head }
    }

    /// ブロック数（torchvision の features.1〜features.17 に対応）
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// 特徴マップ [N, 1280, H/32, W/32]
    /// [-1, 1] → [0, 1] → ImageNet 正規化
    fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        imagenet_normalize((input + 1.0) / 2.0)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.normalize(input);
        let mut x = relu6(self.stem.forward(x));
        for block in &self.blocks {
            x = block.forward(x);
        }
        relu6(self.head.forward(x))
    }
}
