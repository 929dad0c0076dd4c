//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use crate::model::model_metadata::ModelMetadata;
use crate::types::Backbone;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 出力インデックス順のクラスラベル
    pub class_labels: Vec<String>,

    /// 特徴抽出ネットワーク
    pub backbone: Backbone,

    /// モデル入力解像度
    pub image_size: u32,

    /// 分類ヘッドの全結合層ユニット数
    pub dense_units: usize,

    /// 未学習モデルかどうか
    pub dummy: bool,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            backbone: metadata.backbone,
            image_size: metadata.image_size,
            dense_units: metadata.dense_units,
            dummy: metadata.dummy,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }
}

/// フォルダ名のラベルを表示用の病名に変換（`Basal_Cell_Carcinoma` → `Basal Cell Carcinoma`）
pub fn display_name(label: &str) -> String {
    label
        .split(['_', '-'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
