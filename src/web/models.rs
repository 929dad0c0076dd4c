use serde::{Deserialize, Serialize};

use crate::model::display_name;
use crate::types::RankedLabel;

pub const DISCLAIMER: &str = "This result is generated by an AI model and is not a medical diagnosis. \
Please consult a qualified dermatologist for any skin concern.";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RootResponse {
    #[serde(rename = "Hello")]
    pub hello: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Alternative {
    pub disease: String,
    /// "12.3%" 形式
    pub probability: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionResponse {
    pub disease: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<Alternative>>,
    pub disclaimer: String,
}

pub fn format_percentage(probability: f32) -> String {
    format!("{:.1}%", probability * 100.0)
}

impl PredictionResponse {
    /// 確率順のラベルからレスポンスを組み立てる
    ///
    /// 2位以降は最大 `top_k - 1` 件、`min_alternative_confidence` 以上のもののみ返します。
    pub fn from_ranked(
        ranked: &[RankedLabel],
        top_k: usize,
        min_alternative_confidence: f32,
    ) -> Option<Self> {
        let (top, rest) = ranked.split_first()?;

        let alternatives: Vec<Alternative> = rest
            .iter()
            .take(top_k.saturating_sub(1))
            .filter(|r| r.probability >= min_alternative_confidence)
            .map(|r| Alternative {
                disease: display_name(&r.label),
                probability: format_percentage(r.probability),
            })
            .collect();

        Some(PredictionResponse {
            disease: display_name(&top.label),
            confidence: top.probability.clamp(0.0, 1.0),
            alternatives: if alternatives.is_empty() {
                None
            } else {
                Some(alternatives)
            },
            disclaimer: DISCLAIMER.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(items: &[(&str, f32)]) -> Vec<RankedLabel> {
        items
            .iter()
            .map(|(label, probability)| RankedLabel {
                label: label.to_string(),
                probability: *probability,
            })
            .collect()
    }

    #[test]
    fn test_format_percentage() {
        assert_eq!(format_percentage(0.123), "12.3%");
        assert_eq!(format_percentage(1.0), "100.0%");
        assert_eq!(format_percentage(0.0), "0.0%");
    }

    #[test]
    fn test_response_with_alternatives() {
        let items = ranked(&[
            ("Melanocytic_Nevi", 0.8),
            ("Melanoma", 0.15),
            ("Benign_Keratosis", 0.04),
            ("Dermatofibroma", 0.01),
        ]);
        let response = PredictionResponse::from_ranked(&items, 3, 0.01).unwrap();

        assert_eq!(response.disease, "Melanocytic Nevi");
        assert_eq!(response.confidence, 0.8);
        let alternatives = response.alternatives.unwrap();
        assert_eq!(alternatives.len(), 2);
        assert_eq!(alternatives[0].disease, "Melanoma");
        assert_eq!(alternatives[0].probability, "15.0%");
        assert_eq!(alternatives[1].disease, "Benign Keratosis");
    }

    #[test]
    fn test_low_alternatives_are_omitted() {
        let items = ranked(&[("Melanoma", 0.995), ("Dermatofibroma", 0.005)]);
        let response = PredictionResponse::from_ranked(&items, 3, 0.01).unwrap();
        assert!(response.alternatives.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("alternatives").is_none());
        assert!(json["disclaimer"].as_str().unwrap().contains("not a medical diagnosis"));
    }

    #[test]
    fn test_empty_ranking() {
        assert!(PredictionResponse::from_ranked(&[], 3, 0.0).is_none());
    }

    #[test]
    fn test_root_json_shape() {
        let json = serde_json::to_value(RootResponse {
            hello: "DermaAI".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"Hello": "DermaAI"}));
    }
}
