//! HTTP surface: ingest uploads, the peer clone RPC, checksum verification,
//! and file metadata lookups.

mod api;
mod auth;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use magpie_core::Result;
use magpie_core::config::ServerConfig;
use magpie_db::Catalog;
use magpie_store::StoreManager;
use magpie_transfer::TransferManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(
        catalog: Arc<Catalog>,
        stores: Arc<StoreManager>,
        transfers: Arc<TransferManager>,
        config: ServerConfig,
    ) -> Self {
        Self {
            state: AppState {
                catalog,
                stores,
                transfers,
                config,
            },
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.create_router();

        let addr = SocketAddr::new(self.state.config.listen_addr, self.state.config.port);
        info!("librarian listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    fn create_router(&self) -> Router {
        // Everything that writes or reads file bytes requires a known peer
        // token; metadata and liveness stay open for operators.
        let authenticated = Router::new()
            .route("/upload/stage", post(api::upload_stage))
            .route("/upload/flow/{id}", post(api::upload_flow))
            .route("/upload/commit", post(api::upload_commit))
            .route("/clone/prepare", post(api::clone_prepare))
            .route("/clone/staged", post(api::clone_staged))
            .route("/clone/commit", post(api::clone_commit))
            .route("/clone/status", post(api::clone_status))
            .route("/clone/cancel", post(api::clone_cancel))
            .route("/clone/request", post(api::clone_request))
            .route("/checksum/verify", post(api::checksum_verify))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_peer,
            ));

        Router::new()
            .merge(authenticated)
            // File names may contain path separators, so match the rest of
            // the path.
            .route("/file/{*name}", get(api::file_info))
            .route("/health", get(api::health))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub stores: Arc<StoreManager>,
    pub transfers: Arc<TransferManager>,
    pub config: ServerConfig,
}
