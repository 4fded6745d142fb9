use crate::core::oracle::{
    BatchRequest, BatchResponse, CompareRequest, CompareResponse, SimilarityOracle,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type OracleState = Arc<SimilarityOracle>;

pub fn router(oracle: OracleState) -> Router {
    Router::new()
        .route("/compare", post(compare))
        .route("/compareBatch", post(compare_batch))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(oracle)
}

async fn compare(State(oracle): State<OracleState>, Json(req): Json<CompareRequest>) -> Response {
    log::info!("Received request at /compare");
    match oracle.compare(&req.img1, &req.img2).await {
        Ok(similarity) => Json(CompareResponse { similarity }).into_response(),
        Err(e) => {
            log::error!("Error comparing images: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CompareResponse { similarity: 0.0 }),
            )
                .into_response()
        }
    }
}

async fn compare_batch(
    State(oracle): State<OracleState>,
    Json(req): Json<BatchRequest>,
) -> Json<BatchResponse> {
    log::info!("Received request at /compareBatch ({} pairs)", req.pairs.len());
    let results = oracle.compare_batch(req.pairs).await;
    Json(BatchResponse { results })
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_listener<S>(
    listener: TcpListener,
    oracle: OracleState,
    shutdown: S,
) -> Result<(), ServerError>
where
    S: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(oracle).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, oracle: OracleState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Server running on http://{}", listener.local_addr()?);
    serve_listener(listener, oracle, async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutting down");
    })
    .await
}
