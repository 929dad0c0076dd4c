use serde::{Deserialize, Serialize};

/// モデル入力画像の一辺（ピクセル）
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// 特徴抽出に使うネットワーク
///
/// 画素値のスケーリング規約もネットワークごとに異なります。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Backbone {
    /// 入力は [-1, 1] にスケーリング
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,
    /// 入力は 0〜255 の浮動小数点のまま（ネットワーク内部で正規化）
    #[serde(rename = "efficientnet_b1")]
    EfficientNetB1,
}

impl Default for Backbone {
    fn default() -> Self {
        Backbone::MobileNetV2
    }
}

impl Backbone {
    /// 0〜255 の画素値をネットワークの入力規約に変換
    pub fn scale_pixel(&self, value: u8) -> f32 {
        let value = value as f32;
        match self {
            Backbone::MobileNetV2 => value / 127.5 - 1.0,
            Backbone::EfficientNetB1 => value,
        }
    }

    /// スケーリング後の値域 (min, max)
    pub fn value_range(&self) -> (f32, f32) {
        match self {
            Backbone::MobileNetV2 => (-1.0, 1.0),
            Backbone::EfficientNetB1 => (0.0, 255.0),
        }
    }
}

impl std::fmt::Display for Backbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backbone::MobileNetV2 => write!(f, "MobileNetV2"),
            Backbone::EfficientNetB1 => write!(f, "EfficientNetB1"),
        }
    }
}

impl std::str::FromStr for Backbone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "mobilenetv2" => Ok(Backbone::MobileNetV2),
            "efficientnetb1" => Ok(Backbone::EfficientNetB1),
            other => Err(anyhow::anyhow!("Unknown backbone: {}", other)),
        }
    }
}

/// HAM10000_metadata.csv の1行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LesionRecord {
    #[serde(default)]
    pub lesion_id: Option<String>,
    pub image_id: String,
    /// 診断コード（nv, mel, bkl, bcc, akiec, vasc, df）
    pub dx: String,
    #[serde(default)]
    pub dx_type: Option<String>,
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub localization: Option<String>,
}

/// データセットの分割区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Val];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// 推論結果の1クラス分（確率付き）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedLabel {
    pub label: String,
    pub probability: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_pixel() {
        assert_eq!(Backbone::MobileNetV2.scale_pixel(0), -1.0);
        assert_eq!(Backbone::MobileNetV2.scale_pixel(255), 1.0);
        assert_eq!(Backbone::EfficientNetB1.scale_pixel(0), 0.0);
        assert_eq!(Backbone::EfficientNetB1.scale_pixel(255), 255.0);
    }

    #[test]
    fn test_backbone_from_str() {
        assert_eq!("mobilenet_v2".parse::<Backbone>().unwrap(), Backbone::MobileNetV2);
        assert_eq!("EfficientNet-B1".parse::<Backbone>().unwrap(), Backbone::EfficientNetB1);
        assert!("resnet50".parse::<Backbone>().is_err());
    }

    #[test]
    fn test_backbone_serde_name() {
        let json = serde_json::to_string(&Backbone::EfficientNetB1).unwrap();
        assert_eq!(json, "\"efficientnet_b1\"");
    }
}
