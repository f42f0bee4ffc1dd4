//! HTTP/WebSocket surface: the downstream subscribe endpoint on
//! `ws_port`, and `/health`, `/ready`, `/metrics` on `health_check_port`
//! (spec §4.9, §6.2).

use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::session_manager::SessionManager;
use crate::subscriber::{OutboundFrame, Subscriber};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use candle_protocol::{error_codes, ErrorFrame, SubscribeFrame, SubscribedFrame};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: Arc<GatewayConfig>,
}

pub fn ws_router(state: AppState) -> Router {
    Router::new().route("/", get(ws_handler)).layer(TraceLayer::new_for_http()).with_state(state)
}

pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.session_manager.is_healthy();
    let body = Json(json!({
        "status": if healthy { "ready" } else { "not_ready" },
        "sessions": state
            .session_manager
            .session_snapshot()
            .into_iter()
            .map(|(exchange, contract_type, symbols, breaker_state)| {
                json!({
                    "exchange": exchange.as_str(),
                    "contract_type": contract_type,
                    "symbols": symbols,
                    "circuit_breaker": format!("{breaker_state:?}"),
                })
            })
            .collect::<Vec<_>>(),
        "timestamp": Utc::now(),
    }));
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.session_manager.update_queue_gauges();
    ([("content-type", "text/plain; version=0.0.4")], state.metrics.encode())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber_socket(socket, state))
}

async fn handle_subscriber_socket(mut socket: WebSocket, state: AppState) {
    let frame = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<SubscribeFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                send_error(&mut socket, ErrorFrame::new(error_codes::INVALID_SYMBOL, format!("malformed subscribe frame: {e}"))).await;
                return;
            }
        },
        _ => {
            send_error(&mut socket, ErrorFrame::new(error_codes::INVALID_SYMBOL, "expected a subscribe frame as the first message")).await;
            return;
        }
    };

    let subscriber = Arc::new(Subscriber::new(
        frame.exchange,
        frame.contract_type.clone(),
        frame.limit,
        state.config.subscriber_buffer_max,
        state.config.overflow_policy,
    ));

    let outcome = state.session_manager.subscribe(&subscriber, frame.exchange, &frame.contract_type, &frame.symbols);

    for (symbol, code, message) in &outcome.rejected {
        subscriber.send_error(
            ErrorFrame::new(*code, message.clone()).with_exchange(frame.exchange).with_contract_type(frame.contract_type.clone()).with_symbols(vec![symbol.clone()]),
            &state.metrics,
        );
    }

    if outcome.subscribed.is_empty() {
        flush_remaining(&mut socket, &subscriber).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    subscriber.send_subscribed(SubscribedFrame::new(frame.exchange, frame.contract_type.clone(), outcome.subscribed, frame.limit));
    info!(exchange = %frame.exchange, contract_type = %frame.contract_type, subscriber_id = %subscriber.id, "subscriber connected");

    loop {
        tokio::select! {
            biased;
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => { warn!(subscriber_id = %subscriber.id, error = %e, "subscriber socket error"); break; }
                    // No mid-session unsubscribe frame: any other client
                    // message is ignored. Closing the connection is the
                    // only way to unsubscribe.
                    _ => {}
                }
            }
            outbound = subscriber.next_frame() => {
                match outbound {
                    Some(frame) => {
                        if !send_frame(&mut socket, frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.session_manager.unsubscribe_all(subscriber.id);
    info!(subscriber_id = %subscriber.id, "subscriber disconnected");
}

async fn flush_remaining(socket: &mut WebSocket, subscriber: &Subscriber) {
    while let Some(frame) = subscriber.next_frame().await {
        if !send_frame(socket, frame).await {
            break;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: OutboundFrame) -> bool {
    let text = match frame {
        OutboundFrame::Subscribed(f) => serde_json::to_string(&f),
        OutboundFrame::Quote(f) => serde_json::to_string(&f),
        OutboundFrame::Error(f) => serde_json::to_string(&f),
    };
    match text {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn send_error(socket: &mut WebSocket, frame: ErrorFrame) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}
