//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、サーバー、モデル、学習、データセット整理の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::Backbone;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Cpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロード画像の最大サイズ（バイト）
    pub max_upload_bytes: usize,
    /// 応答に含める上位クラス数（先頭の診断名を含む）
    pub top_k: usize,
    /// 代替候補として返す最小確率
    pub min_alternative_confidence: f32,
    /// `Access-Control-Allow-Origin: *` を付与する
    pub allow_any_origin: bool,
    /// ワーカー数（未指定ならCPU数）
    pub workers: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
            top_k: 3,
            min_alternative_confidence: 0.01,
            allow_any_origin: true,
            workers: None,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 推論に使用するモデルファイル（tar.gz）のパス
    pub model_path: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "ml/model.tar.gz".to_string(),
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    /// 回転範囲（度）
    pub rotation_range: f32,
    /// ズーム範囲（1 ± zoom_range 倍）
    pub zoom_range: f32,
    /// 左右反転の確率
    pub horizontal_flip_prob: f32,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            zoom_range: 0.15,
            horizontal_flip_prob: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 特徴抽出ネットワーク
    pub backbone: Backbone,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 分類ヘッドの全結合層ユニット数
    pub dense_units: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 特徴抽出部の重みを固定する
    pub freeze_backbone: bool,
    /// ImageNet学習済み重み（torchvision .pth）のパス
    pub pretrained_weights: Option<String>,
    /// データセットが無い場合に未学習モデルを出力する
    pub dummy_on_missing_data: bool,
    pub augmentation: AugmentationSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            backbone: Backbone::MobileNetV2,
            num_epochs: 10,
            batch_size: 32,
            num_workers: 2,
            learning_rate: 1e-4,
            seed: 42,
            dense_units: 1024,
            dropout: 0.5,
            freeze_backbone: true,
            pretrained_weights: None,
            dummy_on_missing_data: true,
            augmentation: AugmentationSettings::default(),
        }
    }
}

/// データセット整理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// HAM10000 の展開先（画像はサブフォルダ内にあってもよい）
    pub ham_dir: String,
    /// HAM10000 メタデータCSVのファイル名（ham_dir からの相対パス）
    pub metadata_file: String,
    /// 追加の疾患画像（サブフォルダ名 = クラス名）
    pub common_dir: String,
    /// 出力先（train/val）
    pub output_dir: String,
    /// 検証データの割合
    pub val_ratio: f32,
    /// 分割用シード
    pub seed: u64,
    /// 出力先を削除してから整理する
    pub clean_output: bool,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            ham_dir: "ml/data/ham10000".to_string(),
            metadata_file: "HAM10000_metadata.csv".to_string(),
            common_dir: "ml/data/common_diseases".to_string(),
            output_dir: "ml/processed_data".to_string(),
            val_ratio: 0.2,
            seed: 42,
            clean_output: true,
        }
    }
}

impl DatasetSettings {
    pub fn metadata_path(&self) -> PathBuf {
        Path::new(&self.ham_dir).join(&self.metadata_file)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub dataset: DatasetSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 環境変数による上書きを適用する
    ///
    /// - `DERMA_MODEL_PATH`: モデルファイル
    /// - `DERMA_HOST` / `DERMA_PORT`: 待ち受けアドレス
    /// - `DERMA_DATA_DIR`: 整理済みデータセットの出力先
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("DERMA_MODEL_PATH") {
            self.model.model_path = path;
        }
        if let Some(host) = lookup("DERMA_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("DERMA_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("DERMA_PORT が不正です: {}", port),
            }
        }
        if let Some(dir) = lookup("DERMA_DATA_DIR") {
            self.dataset.output_dir = dir;
        }
    }

    /// モデルパスを設定
    pub fn set_model_path(&mut self, path: String) {
        self.model.model_path = path;
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("待ち受け: {}:{}", self.server.host, self.server.port);
        info!("モデルパス: {}", self.model.model_path);
        info!(
            "学習: {} / エポック数 {} / バッチサイズ {} / 学習率 {}",
            self.training.backbone,
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate
        );
        info!("データセット出力先: {}", self.dataset.output_dir);
    }
}
