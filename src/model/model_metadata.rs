//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。
//! 推論時はここに記録されたクラス順序・ネットワーク構成からモデルを復元します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{Backbone, IMAGE_SIZE};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// 出力インデックス順のクラスラベル（学習データのフォルダ名）
    /// 例: ["Actinic_Keratoses", "Basal_Cell_Carcinoma", ..., "Vascular_Lesions"]
    pub class_labels: Vec<String>,

    /// 特徴抽出ネットワーク（入力スケーリングもこれで決まる）
    pub backbone: Backbone,

    /// モデル入力サイズ（正方形、通常224）
    pub image_size: u32,

    /// 分類ヘッドの全結合層ユニット数
    pub dense_units: usize,

    /// 学習時のドロップアウト率
    pub dropout: f64,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 学習データ枚数
    #[serde(default)]
    pub train_samples: usize,

    /// 検証データ枚数
    #[serde(default)]
    pub val_samples: usize,

    /// データセット無しで生成した未学習モデルかどうか
    #[serde(default)]
    pub dummy: bool,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        backbone: Backbone,
        dense_units: usize,
        dropout: f64,
        num_epochs: u32,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            backbone,
            image_size: IMAGE_SIZE as u32,
            dense_units,
            dropout,
            num_epochs,
            train_samples: 0,
            val_samples: 0,
            dummy: false,
            trained_at,
        }
    }

    /// 学習データ枚数を記録
    pub fn with_sample_counts(mut self, train_samples: usize, val_samples: usize) -> Self {
        self.train_samples = train_samples;
        self.val_samples = val_samples;
        self
    }

    /// 未学習モデルとして印を付ける
    pub fn into_dummy(mut self) -> Self {
        self.dummy = true;
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_labels.is_empty() {
            anyhow::bail!("metadata.json has no class labels");
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keeps_class_order() {
        let metadata = ModelMetadata::new(
            vec!["Melanoma".to_string(), "Dermatofibroma".to_string()],
            Backbone::EfficientNetB1,
            1024,
            0.5,
            10,
        )
        .with_sample_counts(80, 20);

        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored, metadata);
        assert_eq!(restored.class_labels[0], "Melanoma");
        assert_eq!(restored.image_size, 224);
        assert!(!restored.dummy);
    }

    #[test]
    fn test_empty_labels_rejected() {
        let metadata = ModelMetadata::new(Vec::new(), Backbone::MobileNetV2, 16, 0.5, 1);
        let json = metadata.to_json_string().unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }
}
