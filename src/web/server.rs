use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use tracing::info;

use crate::ml::Classify;
use crate::model::ServerSettings;
use crate::web::handlers;

/// Shared application state for web handlers
pub struct AppState {
    /// 読み込み済みの分類器（未読み込みなら `/predict` は 500）
    pub classifier: Option<Arc<dyn Classify>>,
    pub settings: ServerSettings,
}

impl AppState {
    pub fn new(classifier: Option<Arc<dyn Classify>>, settings: ServerSettings) -> Self {
        Self {
            classifier,
            settings,
        }
    }
}

/// ルーティング（テストからも使用）
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(handlers::root))
        .route("/health", web::get().to(handlers::health))
        .route("/predict", web::post().to(handlers::predict));
}

/// 別オリジンのフロントエンドから呼べるようにするヘッダ
pub fn cors_headers(allow_any_origin: bool) -> middleware::DefaultHeaders {
    let headers = middleware::DefaultHeaders::new();
    if allow_any_origin {
        headers.add(("Access-Control-Allow-Origin", "*"))
    } else {
        headers
    }
}

/// Start the inference API server
pub async fn start_web_server(state: AppState) -> std::io::Result<()> {
    let host = state.settings.host.clone();
    let port = state.settings.port;
    let workers = state.settings.workers;
    let allow_any_origin = state.settings.allow_any_origin;

    info!("Webサーバーを起動します: http://{}:{}", host, port);

    let app_state = web::Data::new(state);

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors_headers(allow_any_origin))
            .app_data(app_state.clone())
            .configure(configure)
    });
    if let Some(workers) = workers {
        server = server.workers(workers);
    }

    server.bind((host.as_str(), port))?.run().await
}
