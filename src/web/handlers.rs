use actix_multipart::Multipart;
use actix_web::{web, HttpResponse, Responder};
use futures_util::TryStreamExt;
use tracing::{error, info};

use crate::ml::{preprocess_image, rank_predictions};
use crate::types::RankedLabel;
use crate::web::error::ApiError;
use crate::web::models::{HealthResponse, PredictionResponse, RootResponse};
use crate::web::server::AppState;

const FILE_FIELD: &str = "file";

pub async fn root() -> impl Responder {
    HttpResponse::Ok().json(RootResponse {
        hello: "DermaAI".to_string(),
    })
}

pub async fn health(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: data.classifier.is_some(),
    })
}

/// multipart の `file` フィールドを読み出す（他のフィールドは読み捨てる）
async fn read_file_field(payload: &mut Multipart, limit: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::BadMultipart(e.to_string()))?
    {
        let is_file = field.name() == Some(FILE_FIELD);

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| ApiError::BadMultipart(e.to_string()))?
        {
            if !is_file {
                continue;
            }
            if data.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge { limit });
            }
            data.extend_from_slice(&chunk);
        }

        if is_file {
            return Ok(data);
        }
    }

    Err(ApiError::MissingField(FILE_FIELD))
}

/// 画像をアップロードして分類
pub async fn predict(
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let classifier = data.classifier.clone().ok_or(ApiError::ModelNotLoaded)?;
    let bytes = read_file_field(&mut payload, data.settings.max_upload_bytes).await?;
    let size = bytes.len();

    // 前処理と推論はCPU負荷が高いのでブロッキングプールで実行
    let ranked = web::block(move || -> anyhow::Result<Vec<RankedLabel>> {
        let image = preprocess_image(&bytes, classifier.backbone())?;
        let probabilities = classifier.predict(&image)?;
        Ok(rank_predictions(&probabilities, classifier.class_labels()))
    })
    .await
    .map_err(|e| ApiError::Prediction(e.to_string()))?
    .map_err(|e| {
        error!("推論に失敗しました: {:#}", e);
        ApiError::from(e)
    })?;

    let response = PredictionResponse::from_ranked(
        &ranked,
        data.settings.top_k,
        data.settings.min_alternative_confidence,
    )
    .ok_or_else(|| ApiError::Prediction("Model returned no classes".to_string()))?;

    info!(
        "予測: {} ({:.3}), 画像 {} bytes",
        response.disease, response.confidence, size
    );
    Ok(HttpResponse::Ok().json(response))
}
