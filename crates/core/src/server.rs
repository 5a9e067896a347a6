use axum::Router;
use axum::extract::{OriginalUri, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::stream;
use futures_util::stream::StreamExt as _;
use log::*;
use std::convert::Infallible;

use crate::Engine;
use crate::agentic::{self, JsonRpcRequest};
use crate::metrics;
use crate::worker::CrashSnapshot;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// The HTTP host: the function fallback route, the Prometheus endpoint, the
/// debug-gated replay/reload endpoints and, when a tool is configured, the
/// agent message channel.
pub fn router(engine: Engine) -> Router {
  let mut router = Router::new()
    .route("/metrics", get(metrics_handler))
    .route("/__replay", post(replay_handler))
    .route("/__reload", post(reload_handler));

  if engine.config().tool.is_some() {
    router = router
      .route("/mcp", get(sse_handler))
      .route("/mcp/message", post(message_handler));
  }

  return router.fallback(function_handler).with_state(engine);
}

/// Serve until ctrl-c, then tear the engine down.
pub async fn serve(address: &str, engine: Engine) -> Result<(), std::io::Error> {
  let listener = tokio::net::TcpListener::bind(address).await?;
  info!("Gojinn listening on {}", listener.local_addr()?);

  axum::serve(listener, router(engine.clone()).into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  engine.cleanup().await;
  return Ok(());
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    error!("Failed to listen for shutdown signal: {err}");
  }
}

async fn function_handler(State(engine): State<Engine>, request: Request) -> Response {
  let (parts, body) = request.into_parts();

  let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
    Ok(bytes) => bytes,
    Err(err) => {
      warn!("Failed to read request body: {err}");
      return StatusCode::BAD_REQUEST.into_response();
    }
  };

  return engine
    .handle_http(
      parts.method.as_str(),
      &parts.uri.to_string(),
      &parts.headers,
      String::from_utf8_lossy(&bytes).into_owned(),
    )
    .await;
}

async fn metrics_handler() -> Response {
  return (
    [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
    metrics::gather_text(),
  )
    .into_response();
}

fn debug_authorized(engine: &Engine, headers: &HeaderMap) -> bool {
  let secret = &engine.config().debug_secret;
  if secret.is_empty() {
    return false;
  }
  return headers
    .get("x-gojinn-debug-secret")
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v == secret);
}

/// Time-travel debugging: re-run a crash dump synchronously.
async fn replay_handler(
  State(engine): State<Engine>,
  headers: HeaderMap,
  body: String,
) -> Response {
  if !debug_authorized(&engine, &headers) {
    return StatusCode::FORBIDDEN.into_response();
  }

  let dump: CrashSnapshot = match serde_json::from_str(&body) {
    Ok(dump) => dump,
    Err(err) => {
      return (StatusCode::BAD_REQUEST, format!("invalid crash dump: {err}")).into_response();
    }
  };

  return match engine.replay(&dump).await {
    Ok(output) => (StatusCode::OK, output).into_response(),
    Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
  };
}

async fn reload_handler(State(engine): State<Engine>, headers: HeaderMap) -> Response {
  if !debug_authorized(&engine, &headers) {
    return StatusCode::FORBIDDEN.into_response();
  }

  return match engine.reload().await {
    Ok(()) => (StatusCode::OK, "reloaded").into_response(),
    Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
  };
}

/// Event-stream endpoint: announce the message endpoint, then hold the
/// connection until the client disconnects.
async fn sse_handler(
  OriginalUri(uri): OriginalUri,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
  let endpoint = format!("{}/message", uri.path());
  let announce = stream::once(async move {
    return Ok(Event::default().event("endpoint").data(endpoint));
  });

  return Sse::new(announce.chain(stream::pending())).keep_alive(KeepAlive::default());
}

async fn message_handler(
  State(engine): State<Engine>,
  axum::Json(request): axum::Json<JsonRpcRequest>,
) -> Response {
  let response = agentic::handle_message(&engine, request).await;
  return axum::Json(response).into_response();
}
