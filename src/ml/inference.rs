//! モデル推論機能

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use tracing::{info, warn};

use crate::ml::ml_model::{LesionClassifier, ModelConfig};
use crate::ml::preprocess::{preprocess_image, PreprocessedImage};
use crate::model::{load_model_with_metadata, DeviceType, InferenceConfig};
use crate::types::{Backbone, RankedLabel, IMAGE_SIZE};

/// 画像分類器（Web層はこのトレイトにのみ依存する）
pub trait Classify: Send + Sync {
    /// 出力インデックス順のクラスラベル
    fn class_labels(&self) -> &[String];

    /// 入力に適用するスケーリングを決めるベースネットワーク
    fn backbone(&self) -> Backbone;

    /// 前処理済み画像のクラス確率（`class_labels()` と同じ順序）
    fn predict(&self, image: &PreprocessedImage) -> Result<Vec<f32>>;
}

/// 確率を降順に並べ、ラベルと組にする
///
/// NaN は最も小さい値として扱います。
pub fn rank_predictions(probabilities: &[f32], labels: &[String]) -> Vec<RankedLabel> {
    let mut ranked: Vec<RankedLabel> = probabilities
        .iter()
        .zip(labels)
        .map(|(p, label)| RankedLabel {
            label: label.clone(),
            probability: if p.is_nan() { f32::NEG_INFINITY } else { *p },
        })
        .collect();

    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    ranked
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: Mutex<LesionClassifier<B>>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(model_path)?;
        let config = InferenceConfig::from_metadata(&metadata);

        // 前処理は常に IMAGE_SIZE にリサイズするため、それ以外の解像度で学習したモデルは扱えない
        if config.image_size as usize != IMAGE_SIZE {
            anyhow::bail!(
                "Model expects {}x{} input but images are preprocessed to {}x{}: {}",
                config.image_size,
                config.image_size,
                IMAGE_SIZE,
                IMAGE_SIZE,
                model_path.display()
            );
        }

        if config.dummy {
            warn!("未学習のダミーモデルです。予測結果に意味はありません: {}", model_path.display());
        }

        // 推論時はドロップアウトなし
        let model = ModelConfig::new(config.num_classes(), config.backbone)
            .with_dense_units(config.dense_units)
            .with_dropout(0.0)
            .init::<B>(&device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "モデルを読み込みました: {} ({}, {} クラス)",
            model_path.display(),
            config.backbone,
            config.num_classes()
        );

        Ok(Self {
            model: Mutex::new(model),
            config,
            device,
        })
    }

    /// エンコード済み画像を分類して確率順に返す
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Vec<RankedLabel>> {
        let image = preprocess_image(bytes, self.config.backbone)?;
        let probabilities = self.predict(&image)?;
        Ok(rank_predictions(&probabilities, &self.config.class_labels))
    }

    /// 画像ファイルを分類して確率順に返す
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Vec<RankedLabel>> {
        let path = image_path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
        self.classify_bytes(&bytes)
    }
}

impl<B: Backend> Classify for InferenceEngine<B> {
    fn class_labels(&self) -> &[String] {
        &self.config.class_labels
    }

    fn backbone(&self) -> Backbone {
        self.config.backbone
    }

    fn predict(&self, image: &PreprocessedImage) -> Result<Vec<f32>> {
        if image.backbone() != self.config.backbone {
            anyhow::bail!(
                "Image was preprocessed for {} but the model expects {}",
                image.backbone(),
                self.config.backbone
            );
        }

        let tensor = image.to_tensor::<B>(&self.device);
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("Model lock poisoned"))?;
        let output = model.predict_proba(tensor);

        output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
    }
}

/// デバイス設定に応じたバックエンドで分類器を読み込む
pub fn load_classifier<P: AsRef<Path>>(
    model_path: P,
    device_type: DeviceType,
) -> Result<Arc<dyn Classify>> {
    match device_type {
        DeviceType::Cpu => Ok(Arc::new(InferenceEngine::<NdArray<f32>>::load(
            model_path,
            NdArrayDevice::Cpu,
        )?)),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => Ok(Arc::new(InferenceEngine::<burn::backend::Wgpu>::load(
            model_path,
            burn::backend::wgpu::WgpuDevice::default(),
        )?)),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            warn!("`wgpu` 機能が無効なため CPU で推論します");
            Ok(Arc::new(InferenceEngine::<NdArray<f32>>::load(
                model_path,
                NdArrayDevice::Cpu,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::preprocess::tests::encode;
    use crate::ml::training::write_dummy_model;
    use crate::model::{save_model_with_metadata, TrainingSettings};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rank_predictions_sorted_and_paired() {
        let ranked = rank_predictions(&[0.1, 0.7, 0.2], &labels(&["a", "b", "c"]));
        let order: Vec<&str> = ranked.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(ranked[0].probability, 0.7);
        assert_eq!(ranked[2].probability, 0.1);
    }

    #[test]
    fn test_rank_predictions_nan_last() {
        let ranked = rank_predictions(&[f32::NAN, 0.3, 0.6], &labels(&["x", "y", "z"]));
        assert_eq!(ranked[0].label, "z");
        assert_eq!(ranked[2].label, "x");
    }

    #[test]
    fn test_rank_predictions_ties_keep_order() {
        let ranked = rank_predictions(&[0.5, 0.5], &labels(&["first", "second"]));
        assert_eq!(ranked[0].label, "first");
        assert_eq!(ranked[1].label, "second");
    }

    #[test]
    fn test_engine_roundtrip_with_dummy_model() {
        let dir = TempDir::new().unwrap();
        let settings = TrainingSettings {
            dense_units: 8,
            ..TrainingSettings::default()
        };
        let report = write_dummy_model(&settings, &dir.path().join("model")).unwrap();

        let classifier = load_classifier(&report.output_path, DeviceType::Cpu).unwrap();
        assert_eq!(classifier.class_labels(), report.class_labels.as_slice());
        assert_eq!(classifier.backbone(), settings.backbone);

        let img = RgbImage::from_pixel(100, 80, Rgb([180, 120, 90]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        let image = preprocess_image(&bytes, classifier.backbone()).unwrap();

        let probabilities = classifier.predict(&image).unwrap();
        assert_eq!(probabilities.len(), 7);
        let sum: f32 = probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum = {}", sum);
    }

    #[test]
    fn test_engine_rejects_mismatched_scaling() {
        let dir = TempDir::new().unwrap();
        let settings = TrainingSettings {
            dense_units: 8,
            ..TrainingSettings::default()
        };
        let report = write_dummy_model(&settings, &dir.path().join("model")).unwrap();
        let engine =
            InferenceEngine::<NdArray<f32>>::load(&report.output_path, NdArrayDevice::Cpu).unwrap();

        let other = PreprocessedImage::zeros(Backbone::EfficientNetB1);
        assert!(engine.predict(&other).is_err());

        let ranked = engine
            .classify_bytes(&encode(
                DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]))),
                ImageFormat::Png,
            ))
            .unwrap();
        assert_eq!(ranked.len(), 7);
        assert!(ranked.windows(2).all(|w| w[0].probability >= w[1].probability));
    }

    #[test]
    fn test_classify_image_file() {
        let dir = TempDir::new().unwrap();
        let settings = TrainingSettings {
            dense_units: 8,
            ..TrainingSettings::default()
        };
        let report = write_dummy_model(&settings, &dir.path().join("model")).unwrap();
        let engine =
            InferenceEngine::<NdArray<f32>>::load(&report.output_path, NdArrayDevice::Cpu).unwrap();

        let image_path = dir.path().join("lesion.jpg");
        RgbImage::from_pixel(50, 40, Rgb([150, 90, 70])).save(&image_path).unwrap();

        let ranked = engine.classify_image(&image_path).unwrap();
        assert_eq!(ranked.len(), 7);
        assert!(engine.classify_image(dir.path().join("missing.jpg")).is_err());
    }

    #[test]
    fn test_engine_rejects_other_input_size() {
        let dir = TempDir::new().unwrap();
        let settings = TrainingSettings {
            dense_units: 8,
            ..TrainingSettings::default()
        };
        let report = write_dummy_model(&settings, &dir.path().join("model")).unwrap();

        let (mut metadata, bytes) = load_model_with_metadata(&report.output_path).unwrap();
        metadata.image_size = 512;
        let resized = save_model_with_metadata(&dir.path().join("resized"), &metadata, &bytes).unwrap();

        let err = InferenceEngine::<NdArray<f32>>::load(&resized, NdArrayDevice::Cpu)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("512x512"));
    }

    #[test]
    fn test_load_missing_model_is_error() {
        assert!(load_classifier("/nonexistent/model.tar.gz", DeviceType::Cpu).is_err());
    }
}
