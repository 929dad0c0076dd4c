//! 皮膚病変分類モデルの定義
//!
//! 事前学習済みCNN（MobileNetV2 / EfficientNet-B1）を特徴抽出部とし、
//! その上に全結合の分類ヘッドを載せた転移学習用モデルです。

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use tracing::debug;

use crate::ml::efficientnet::{EfficientNetB1, EFFICIENTNET_B1_FEATURES};
use crate::ml::mobilenet::{MobileNetV2, MOBILENET_V2_FEATURES};
use crate::types::Backbone;

/// 特徴抽出部（事前学習済みベースネットワーク）
#[derive(Module, Debug)]
pub enum FeatureExtractor<B: Backend> {
    MobileNetV2(MobileNetV2<B>),
    EfficientNetB1(EfficientNetB1<B>),
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn new(backbone: Backbone, device: &B::Device) -> Self {
        match backbone {
            Backbone::MobileNetV2 => FeatureExtractor::MobileNetV2(MobileNetV2::new(device)),
            Backbone::EfficientNetB1 => {
                FeatureExtractor::EfficientNetB1(EfficientNetB1::new(device))
            }
        }
    }

    pub fn backbone(&self) -> Backbone {
        match self {
            FeatureExtractor::MobileNetV2(_) => Backbone::MobileNetV2,
            FeatureExtractor::EfficientNetB1(_) => Backbone::EfficientNetB1,
        }
    }

    /// 出力特徴チャネル数
    pub fn num_features(&self) -> usize {
        match self {
            FeatureExtractor::MobileNetV2(_) => MOBILENET_V2_FEATURES,
            FeatureExtractor::EfficientNetB1(_) => EFFICIENTNET_B1_FEATURES,
        }
    }

    /// NCHW 入力から特徴マップを計算
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            FeatureExtractor::MobileNetV2(net) => net.forward(images),
            FeatureExtractor::EfficientNetB1(net) => net.forward(images),
        }
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ベースネットワーク
    pub backbone: Backbone,
    /// 分類ヘッドの中間層ユニット数
    #[config(default = 1024)]
    pub dense_units: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化（ベースはランダム初期化）
    pub fn init<B: Backend>(&self, device: &B::Device) -> LesionClassifier<B> {
        self.init_with_features(FeatureExtractor::new(self.backbone, device), device)
    }

    /// 既存の特徴抽出部（事前学習済み重みなど）を使ってモデルを初期化
    pub fn init_with_features<B: Backend>(
        &self,
        features: FeatureExtractor<B>,
        device: &B::Device,
    ) -> LesionClassifier<B> {
        let num_features = features.num_features();

        debug!(
            "[Model] {} -> GAP({}) -> FC {} -> Dropout({}) -> FC {}",
            self.backbone, num_features, self.dense_units, self.dropout, self.num_classes
        );

        LesionClassifier {
            features,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(num_features, self.dense_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.dense_units, self.num_classes).init(device),
            activation: Relu::new(),
            frozen: false,
        }
    }
}

/// 皮膚病変分類モデル
///
/// # アーキテクチャ
/// - 特徴抽出部（MobileNetV2 / EfficientNet-B1、出力 1280ch）
/// - Global Average Pooling
/// - FC: 1280 -> dense_units + ReLU
/// - Dropout
/// - FC: dense_units -> num_classes
/// - Softmax（`predict_proba` のみ）
#[derive(Module, Debug)]
pub struct LesionClassifier<B: Backend> {
    features: FeatureExtractor<B>,
    pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
    /// 特徴抽出部を凍結しているか（学習時のみ意味を持つ）
    frozen: bool,
}

impl<B: Backend> LesionClassifier<B> {
    pub fn backbone(&self) -> Backbone {
        self.features.backbone()
    }

    /// 特徴抽出部を凍結
    ///
    /// 勾配を計算しないだけでなく、学習中も BatchNorm は移動統計で推論モードのまま動かします
    /// （`forward_train` を参照）。
    pub fn freeze_features(mut self) -> Self {
        self.features = self.features.no_grad();
        self.frozen = true;
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 224, 224, 3]（NHWC、前処理済み）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // NHWC -> NCHW
        let x = images.permute([0, 3, 1, 2]);
        let x = self.features.forward(x);
        self.classify_features(x)
    }

    /// 特徴マップ [batch_size, C, H, W] からロジットを計算（GAP → FC → ReLU → Dropout → FC）
    fn classify_features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = x.dims();
        let x = self.pool.forward(x);
        let [_, c, _, _] = x.dims();
        let x = x.reshape([batch_size, c]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        classification_output(self.forward(images), targets)
    }
}

impl<B: AutodiffBackend> LesionClassifier<B> {
    /// 学習時の順伝播
    ///
    /// 凍結中の特徴抽出部は内部バックエンド上で計算するため、BatchNorm の移動統計は
    /// 更新されず、勾配もヘッドにしか流れません。
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = images.permute([0, 3, 1, 2]);
        let x = if self.frozen {
            Tensor::from_inner(self.features.valid().forward(x.inner()))
        } else {
            self.features.forward(x)
        };
        self.classify_features(x)
    }

    /// 学習時の順伝播と損失計算
    pub fn forward_classification_train(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        classification_output(self.forward_train(images), targets)
    }
}

fn classification_output<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> ClassificationOutput<B> {
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), targets.clone());

    ClassificationOutput::new(loss, output, targets)
}
