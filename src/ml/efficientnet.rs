//! EfficientNet-B1 特徴抽出部
//!
//! 入力は 0〜255 の生画素値（NCHW）。先頭で /255 と ImageNet 平均・標準偏差による正規化を行います。
//! 深さ係数 1.1（B0 の繰り返し数を切り上げ）、幅係数 1.0。

use burn::{prelude::*, tensor::activation::silu};

use crate::ml::blocks::{imagenet_normalize, ConvNorm, SqueezeExcitation};

/// 出力特徴チャネル数
pub const EFFICIENTNET_B1_FEATURES: usize = 1280;

const STEM_CHANNELS: usize = 32;
const DEPTH_MULTIPLIER: f64 = 1.1;

/// B0 のステージ構成 (拡張率, カーネル, ストライド, 入力ch, 出力ch, 繰り返し)
const B0_STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

fn scaled_repeats(repeats: usize) -> usize {
    (repeats as f64 * DEPTH_MULTIPLIER).ceil() as usize
}

/// MBConv ブロック（拡張 → depthwise → SE → 射影）
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    squeeze: SqueezeExcitation<B>,
    project: ConvNorm<B>,
    use_residual: bool,
}

impl<B: Backend> MbConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
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
        let squeeze_channels = (in_channels / 4).max(1);

        MbConv {
            expand,
            depthwise: ConvNorm::depthwise(hidden, kernel_size, stride, device),
            squeeze: SqueezeExcitation::new(hidden, squeeze_channels, device),
            project: ConvNorm::pointwise(hidden, out_channels, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => silu(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = silu(self.depthwise.forward(x));
        let x = self.squeeze.forward(x);
        let x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct EfficientStage<B: Backend> {
    blocks: Vec<MbConv<B>>,
}

impl<B: Backend> EfficientStage<B> {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(input, |x, block| block.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct EfficientNetB1<B: Backend> {
    stem: ConvNorm<B>,
    stages: Vec<EfficientStage<B>>,
    head: ConvNorm<B>,
}

impl<B: Backend> EfficientNetB1<B> {
    pub fn new(device: &Device<B>) -> Self {
        let stem = ConvNorm::new(3, STEM_CHANNELS, 3, 2, 1, device);

        let stages = B0_STAGES
            .iter()
            .map(|&(expand_ratio, kernel, stride, in_channels, out_channels, repeats)| {
                let blocks = (0..scaled_repeats(repeats))
                    .map(|i| {
                        let (input, stride) = if i == 0 {
                            (in_channels, stride)
                        } else {
                            (out_channels, 1)
                        };
                        MbConv::new(input, out_channels, kernel, stride, expand_ratio, device)
                    })
                    .collect();
                EfficientStage { blocks }
            })
            .collect();

        let head = ConvNorm::pointwise(320, EFFICIENTNET_B1_FEATURES, device);

        EfficientNetB1 { stem, stages, head }
    }

    /// ステージごとのブロック数
    pub fn stage_depths(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.len()).collect()
    }

    /// 特徴マップ [N, 1280, H/32, W/32]
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        // 0〜255 → [0, 1] → ImageNet 正規化
        let x = imagenet_normalize(input / 255.0);
        let mut x = silu(self.stem.forward(x));
        for stage in &self.stages {
            x = stage.forward(x);
        }
        silu(self.head.forward(x))
    }
}
