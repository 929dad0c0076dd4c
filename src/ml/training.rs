//! モデル学習（転移学習）
//!
//! `<data_dir>/{train,val}/<クラス名>/*.jpg` の構成を前提とします（`organize` の出力）。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::Module,
    optim::AdamConfig,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, LearningStrategy, TrainOutput, TrainStep, ValidStep,
    },
};
use tracing::{info, warn};

use crate::dataset::HAM_LABELS;
use crate::ml::augmentation::ImageAugmenter;
use crate::ml::ml_model::{FeatureExtractor, LesionClassifier, ModelConfig};
use crate::ml::preprocess::{decode_rgb, preprocess_rgb, stack_to_tensor, PreprocessedImage};
use crate::model::{save_model_with_metadata, DeviceType, ModelMetadata, TrainingSettings};
use crate::types::{Backbone, Split};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ直下のサブディレクトリ名（ソート済み）
pub fn class_directories(dir: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                classes.push(name.to_string());
            }
        }
    }
    classes.sort();
    Ok(classes)
}

/// 学習データセット（パスのリストのみ保持）
pub struct LesionDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl LesionDataset {
    /// 指定されたクラス順序で `<dir>/<クラス名>/` から画像を列挙
    ///
    /// `class_order` に無いディレクトリは警告してスキップします。
    pub fn from_split_dir(dir: &Path, class_order: &[String]) -> Result<Self> {
        for name in class_directories(dir)? {
            if !class_order.contains(&name) {
                warn!("学習クラスに存在しないため無視します: {} ({})", name, dir.display());
            }
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = dir.join(class_name);
            if !class_dir.is_dir() {
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    paths.push(path);
                }
            }
            paths.sort();
            samples.extend(paths.into_iter().map(|p| (p, class_id)));
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, id) in &self.samples {
            counts[*id] += 1;
        }
        counts
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LesionItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<LesionItem> for LesionDataset {
    fn get(&self, index: usize) -> Option<LesionItem> {
        let (path, label) = self.samples.get(index)?;
        Some(LesionItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
///
/// 拡張器が設定されている場合（学習用）は読み込み後にデータ拡張を適用します。
#[derive(Clone)]
pub struct LesionBatcher {
    backbone: Backbone,
    augmenter: Option<ImageAugmenter>,
}

impl LesionBatcher {
    pub fn new(backbone: Backbone, augmenter: Option<ImageAugmenter>) -> Self {
        Self { backbone, augmenter }
    }

    fn load_item(&self, item: &LesionItem) -> PreprocessedImage {
        let loaded = std::fs::read(&item.path)
            .with_context(|| format!("Failed to read {}", item.path.display()))
            .and_then(|bytes| decode_rgb(&bytes));

        match loaded {
            Ok(img) => {
                let img = match &self.augmenter {
                    Some(augmenter) => augmenter.augment(&img),
                    None => img,
                };
                preprocess_rgb(&img, self.backbone)
            }
            Err(e) => {
                // エラーの場合はゼロで埋める
                warn!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                PreprocessedImage::zeros(self.backbone)
            }
        }
    }
}

impl<B: Backend> Batcher<B, LesionItem, LesionBatch<B>> for LesionBatcher {
    fn batch(&self, items: Vec<LesionItem>, device: &B::Device) -> LesionBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut targets_vec = Vec::with_capacity(items.len());

        for item in &items {
            images.push(self.load_item(item));
            targets_vec.push(item.label as i64);
        }

        let images = stack_to_tensor::<B>(images, device);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        LesionBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LesionBatch<B: Backend> {
    /// [N, 224, 224, 3]
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<LesionBatch<B>, ClassificationOutput<B>> for LesionClassifier<B> {
    fn step(&self, batch: LesionBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification_train(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<LesionBatch<B>, ClassificationOutput<B>> for LesionClassifier<B> {
    fn step(&self, batch: LesionBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub output_path: PathBuf,
    pub class_labels: Vec<String>,
    pub train_samples: usize,
    pub val_samples: usize,
    pub dummy: bool,
}

fn model_config(settings: &TrainingSettings, num_classes: usize) -> ModelConfig {
    ModelConfig::new(num_classes, settings.backbone)
        .with_dense_units(settings.dense_units)
        .with_dropout(settings.dropout)
}

/// 特徴抽出部を作成（事前学習済み重みがあれば読み込む）
///
/// 戻り値の `bool` は事前学習済み重みを読み込んだかどうか。
#[cfg(feature = "pretrained")]
fn base_features<B: Backend>(
    settings: &TrainingSettings,
    device: &B::Device,
) -> Result<(FeatureExtractor<B>, bool)> {
    match settings.pretrained_weights.as_deref() {
        Some(path) => {
            let features = crate::ml::pretrained::load_pretrained_features(
                settings.backbone,
                Path::new(path),
                device,
            )?;
            Ok((features, true))
        }
        None => {
            warn!("事前学習済み重みが指定されていません。ベースはランダム初期化されます");
            Ok((FeatureExtractor::new(settings.backbone, device), false))
        }
    }
}

#[cfg(not(feature = "pretrained"))]
fn base_features<B: Backend>(
    settings: &TrainingSettings,
    device: &B::Device,
) -> Result<(FeatureExtractor<B>, bool)> {
    if let Some(path) = &settings.pretrained_weights {
        warn!(
            "`pretrained` 機能が無効なため重みを読み込めません: {}。ベースはランダム初期化されます",
            path
        );
    } else {
        warn!("事前学習済み重みが指定されていません。ベースはランダム初期化されます");
    }
    Ok((FeatureExtractor::new(settings.backbone, device), false))
}

/// ベースを凍結するか
///
/// ランダム初期化のベースを凍結するとヘッドはランダム特徴しか学習できないため、
/// 事前学習済み重みを読み込んだ場合のみ凍結します。
fn should_freeze(settings: &TrainingSettings, pretrained: bool) -> bool {
    if !settings.freeze_backbone {
        return false;
    }
    if !pretrained {
        warn!("事前学習済み重みが無いため、ベースネットワークも含めて学習します");
        return false;
    }
    true
}

/// モデルの重みをバイト列に変換（フル精度）
pub fn model_to_bytes<B: Backend>(model: LesionClassifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("Failed to serialize model weights: {:?}", e))
}

/// 未学習のダミーモデルを保存（データセットが無い環境で推論経路を確認するため）
pub fn write_dummy_model(settings: &TrainingSettings, output: &Path) -> Result<TrainingReport> {
    let device = NdArrayDevice::Cpu;
    // HAM10000 の7クラス（学習時と同じくフォルダ名順）
    let mut class_labels: Vec<String> = HAM_LABELS.iter().map(|(_, label)| label.to_string()).collect();
    class_labels.sort();

    let config = model_config(settings, class_labels.len());
    let model = config.init::<NdArray<f32>>(&device);
    let bytes = model_to_bytes(model)?;

    let metadata = ModelMetadata::new(
        class_labels.clone(),
        settings.backbone,
        settings.dense_units,
        settings.dropout,
        0,
    )
    .into_dummy();
    let output_path = save_model_with_metadata(output, &metadata, &bytes)?;

    warn!("ダミーモデルを保存しました（未学習）: {}", output_path.display());

    Ok(TrainingReport {
        output_path,
        class_labels,
        train_samples: 0,
        val_samples: 0,
        dummy: true,
    })
}

/// モデル学習を実行
///
/// `<data_dir>/train` が存在しない場合、`dummy_on_missing_data` が有効ならダミーモデルを保存します。
pub fn train_model(
    settings: &TrainingSettings,
    data_dir: &Path,
    output: &Path,
    device_type: DeviceType,
) -> Result<TrainingReport> {
    let train_dir = data_dir.join(Split::Train.dir_name());
    if !train_dir.is_dir() {
        if settings.dummy_on_missing_data {
            warn!("学習データが見つかりません: {}", train_dir.display());
            return write_dummy_model(settings, output);
        }
        anyhow::bail!("Training data not found: {}", train_dir.display());
    }

    match device_type {
        DeviceType::Cpu => {
            info!("CPU (NdArray) モードで学習を開始します");
            run_training::<Autodiff<NdArray<f32>>>(settings, data_dir, output, NdArrayDevice::Cpu)
        }
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            info!("GPU (WGPU) モードで学習を開始します");
            run_training::<Autodiff<burn::backend::Wgpu>>(
                settings,
                data_dir,
                output,
                burn::backend::wgpu::WgpuDevice::default(),
            )
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            warn!("`wgpu` 機能が無効なため CPU で学習します");
            run_training::<Autodiff<NdArray<f32>>>(settings, data_dir, output, NdArrayDevice::Cpu)
        }
    }
}

fn run_training<B: AutodiffBackend>(
    settings: &TrainingSettings,
    data_dir: &Path,
    output: &Path,
    device: B::Device,
) -> Result<TrainingReport> {
    let train_dir = data_dir.join(Split::Train.dir_name());
    let val_dir = data_dir.join(Split::Val.dir_name());

    let class_labels = class_directories(&train_dir)?;
    if class_labels.is_empty() {
        anyhow::bail!("No class directories found in {}", train_dir.display());
    }
    info!("全クラス順序 ({}個): {}", class_labels.len(), class_labels.join(", "));

    let dataset_train = LesionDataset::from_split_dir(&train_dir, &class_labels)?;
    let dataset_val = if val_dir.is_dir() {
        LesionDataset::from_split_dir(&val_dir, &class_labels)?
    } else {
        warn!("検証データが見つかりません: {}", val_dir.display());
        LesionDataset {
            samples: Vec::new(),
            class_names: class_labels.clone(),
        }
    };

    if dataset_train.len() == 0 {
        anyhow::bail!("No training images found in {}", train_dir.display());
    }
    for (name, count) in class_labels.iter().zip(dataset_train.class_counts()) {
        info!("  クラス '{}': {} 枚", name, count);
    }

    let train_samples = dataset_train.len();
    let val_samples = dataset_val.len();
    info!("学習データ: {} 枚", train_samples);
    info!("検証データ: {} 枚", val_samples);

    // モデル構築
    let config = model_config(settings, class_labels.len());
    let (features, pretrained) = base_features::<B>(settings, &device)?;
    let mut model = config.init_with_features(features, &device);
    if should_freeze(settings, pretrained) {
        model = model.freeze_features();
    }
    info!(
        "ベースネットワーク: {}",
        if model.is_frozen() { "凍結" } else { "学習対象" }
    );

    // バッチャー・データローダー作成
    let batcher_train = LesionBatcher::new(
        settings.backbone,
        Some(ImageAugmenter::new(settings.augmentation.clone())),
    );
    let batcher_val = LesionBatcher::new(settings.backbone, None);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(dataset_val);

    let artifact_dir =
        std::env::temp_dir().join(format!("derma_ai_training_{}", std::process::id()));
    std::fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("Failed to create artifact dir: {}", artifact_dir.display()))?;

    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    );

    let artifact_dir_str = artifact_dir.to_string_lossy().to_string();
    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs)
        .summary()
        .build(model, AdamConfig::new().init(), settings.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_val);
    info!("学習が完了しました");

    let model_binary = model_to_bytes(model_trained.model)?;

    let metadata = ModelMetadata::new(
        class_labels.clone(),
        settings.backbone,
        settings.dense_units,
        settings.dropout,
        settings.num_epochs as u32,
    )
    .with_sample_counts(train_samples, val_samples);
    let output_path = save_model_with_metadata(output, &metadata, &model_binary)?;

    std::fs::remove_dir_all(&artifact_dir).ok();

    Ok(TrainingReport {
        output_path,
        class_labels,
        train_samples,
        val_samples,
        dummy: false,
    })
}
