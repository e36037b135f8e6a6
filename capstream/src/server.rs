use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use capstream_core::metrics;
use capstream_core::models::generate_id;
use capstream_pipeline::{ReaderState, ReaderStatus, SubscriberRegistry};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: SubscriberRegistry,
    pub reader_status: watch::Receiver<ReaderStatus>,
    pub destination: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve HTTP until a shutdown signal arrives
pub async fn serve(address: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Attach a WebSocket to the live destination
async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    // Subscribers only listen; anything they send is discarded
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = generate_id();
    let mut rx = state
        .registry
        .subscribe(&state.destination, connection_id.clone());
    let (mut sink, mut stream) = socket.split();

    let forward = async {
        while let Some(payload) = rx.recv().await {
            let message = match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => Message::Binary(payload),
            };
            if let Err(e) = sink.send(message).await {
                debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    };

    let drain = async {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        () = forward => {}
        () = drain => {}
    }

    state.registry.unsubscribe(&connection_id);
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    reader: ReaderStatus,
    subscribers: usize,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let reader = *state.reader_status.borrow();
    let (code, status) = match reader.state {
        ReaderState::Streaming => (StatusCode::OK, "ok"),
        ReaderState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            reader,
            subscribers: state.registry.connection_count(),
        }),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
