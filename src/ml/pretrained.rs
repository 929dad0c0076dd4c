//! ImageNet 事前学習済み重みの読み込み
//!
//! torchvision のチェックポイント（`mobilenet_v2` / `efficientnet_b1` の `.pth`）を
//! キー名を付け替えて特徴抽出部のレコードとして読み込みます。
//! 分類器（`classifier.*`）の重みは使用しません。

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::info;

use crate::ml::efficientnet::{EfficientNetB1, EfficientNetB1Record};
use crate::ml::ml_model::FeatureExtractor;
use crate::ml::mobilenet::{MobileNetV2, MobileNetV2Record};
use crate::types::Backbone;

/// torchvision の features.1〜features.17
const MOBILENET_V2_BLOCKS: usize = 17;
/// torchvision の features.1〜features.7
const EFFICIENTNET_STAGES: usize = 7;

/// Conv2dNormActivation (`X.0` = conv, `X.1` = bn) を ConvNorm に対応付ける
fn conv_norm_remap(args: LoadArgs, from: &str, to: &str) -> LoadArgs {
    args.with_key_remap(&format!(r"^{}\.0\.(.+)$", from), &format!("{}.conv.$1", to))
        .with_key_remap(&format!(r"^{}\.1\.(.+)$", from), &format!("{}.norm.$1", to))
}

fn mobilenet_v2_args(weights_path: &Path) -> LoadArgs {
    let mut args = LoadArgs::new(weights_path.to_path_buf());
    args = conv_norm_remap(args, r"features\.0", "stem");

    // features.1 は拡張層なし: conv.0 = depthwise, conv.1 = 射影 conv, conv.2 = 射影 bn
    args = conv_norm_remap(args, r"features\.1\.conv\.0", "blocks.0.depthwise")
        .with_key_remap(r"^features\.1\.conv\.1\.(.+)$", "blocks.0.project.conv.$1")
        .with_key_remap(r"^features\.1\.conv\.2\.(.+)$", "blocks.0.project.norm.$1");

    // features.2〜17: conv.0 = 拡張, conv.1 = depthwise, conv.2/3 = 射影 conv/bn
    for n in 2..=MOBILENET_V2_BLOCKS {
        let block = format!("blocks.{}", n - 1);
        args = conv_norm_remap(
            args,
            &format!(r"features\.{}\.conv\.0", n),
            &format!("{}.expand", block),
        );
        args = conv_norm_remap(
            args,
            &format!(r"features\.{}\.conv\.1", n),
            &format!("{}.depthwise", block),
        );
        args = args
            .with_key_remap(
                &format!(r"^features\.{}\.conv\.2\.(.+)$", n),
                &format!("{}.project.conv.$1", block),
            )
            .with_key_remap(
                &format!(r"^features\.{}\.conv\.3\.(.+)$", n),
                &format!("{}.project.norm.$1", block),
            );
    }

    conv_norm_remap(args, r"features\.18", "head")
}

fn efficientnet_b1_args(weights_path: &Path) -> LoadArgs {
    let mut args = LoadArgs::new(weights_path.to_path_buf());
    args = conv_norm_remap(args, r"features\.0", "stem");

    for s in 1..=EFFICIENTNET_STAGES {
        let from = format!(r"features\.{}\.(\d+)\.block", s);
        let to = format!("stages.{}.blocks.$1", s - 1);

        // ステージ1のみ拡張層なしでインデックスが1つずれる
        let (depthwise, squeeze, project) = if s == 1 {
            (0, 1, 2)
        } else {
            args = args
                .with_key_remap(
                    &format!(r"^{}\.0\.0\.(.+)$", from),
                    &format!("{}.expand.conv.$2", to),
                )
                .with_key_remap(
                    &format!(r"^{}\.0\.1\.(.+)$", from),
                    &format!("{}.expand.norm.$2", to),
                );
            (1, 2, 3)
        };

        args = args
            .with_key_remap(
                &format!(r"^{}\.{}\.0\.(.+)$", from, depthwise),
                &format!("{}.depthwise.conv.$2", to),
            )
            .with_key_remap(
                &format!(r"^{}\.{}\.1\.(.+)$", from, depthwise),
                &format!("{}.depthwise.norm.$2", to),
            )
            .with_key_remap(
                &format!(r"^{}\.{}\.fc1\.(.+)$", from, squeeze),
                &format!("{}.squeeze.reduce.$2", to),
            )
            .with_key_remap(
                &format!(r"^{}\.{}\.fc2\.(.+)$", from, squeeze),
                &format!("{}.squeeze.expand.$2", to),
            )
            .with_key_remap(
                &format!(r"^{}\.{}\.0\.(.+)$", from, project),
                &format!("{}.project.conv.$2", to),
            )
            .with_key_remap(
                &format!(r"^{}\.{}\.1\.(.+)$", from, project),
                &format!("{}.project.norm.$2", to),
            );
    }

    conv_norm_remap(args, r"features\.8", "head")
}

/// 事前学習済み重みを読み込んだ特徴抽出部を作成
pub fn load_pretrained_features<B: Backend>(
    backbone: Backbone,
    weights_path: &Path,
    device: &B::Device,
) -> Result<FeatureExtractor<B>> {
    if !weights_path.exists() {
        anyhow::bail!("Pretrained weights not found: {}", weights_path.display());
    }
    info!("事前学習済み重みを読み込みます: {} ({})", weights_path.display(), backbone);

    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();
    let features = match backbone {
        Backbone::MobileNetV2 => {
            let record: MobileNetV2Record<B> = recorder
                .load(mobilenet_v2_args(weights_path), device)
                .context("Failed to map torchvision mobilenet_v2 weights")?;
            FeatureExtractor::MobileNetV2(MobileNetV2::new(device).load_record(record))
        }
        Backbone::EfficientNetB1 => {
            let record: EfficientNetB1Record<B> = recorder
                .load(efficientnet_b1_args(weights_path), device)
                .context("Failed to map torchvision efficientnet_b1 weights")?;
            FeatureExtractor::EfficientNetB1(EfficientNetB1::new(device).load_record(record))
        }
    };

    info!("事前学習済み重みの読み込み完了");
    Ok(features)
}
