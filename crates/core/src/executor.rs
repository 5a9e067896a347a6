use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use log::*;
use std::time::{Duration, Instant};

use crate::buffer_pool::BufferPool;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::metrics::metrics;
use crate::pool::WorkerPool;
use crate::runtime::ExecError;

pub(crate) struct SyncDeps<'a> {
  pub pool: &'a WorkerPool,
  pub buffers: &'a BufferPool,
  pub path: &'a str,
  pub timeout: Duration,
}

/// Compose the stdin envelope for an HTTP request. The trace id prefers the
/// W3C `traceparent` header and falls back to `X-Request-Id`.
pub(crate) fn envelope_from_request(
  method: &str,
  uri: &str,
  headers: &HeaderMap,
  body: String,
) -> RequestEnvelope {
  let trace_id = headers
    .get("traceparent")
    .or_else(|| headers.get("x-request-id"))
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .unwrap_or_default();

  let mut header_map: std::collections::HashMap<String, Vec<String>> =
    std::collections::HashMap::new();
  for (name, value) in headers {
    if let Ok(value) = value.to_str() {
      header_map
        .entry(name.as_str().to_string())
        .or_default()
        .push(value.to_string());
    }
  }

  return RequestEnvelope {
    method: method.to_string(),
    uri: uri.to_string(),
    headers: header_map,
    body,
    trace_id,
  };
}

/// Balances the active-sandbox gauge on every return path.
struct ActiveGuard(prometheus::IntGauge);

impl ActiveGuard {
  fn enter(path: &str) -> Self {
    let gauge = metrics().active.with_label_values(&[path]);
    gauge.inc();
    return Self(gauge);
  }
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self.0.dec();
  }
}

/// One-shot synchronous execution of the function against a pooled pair.
/// Every outcome lands in the duration histogram under its status label.
pub(crate) async fn execute_sync(deps: SyncDeps<'_>, envelope: RequestEnvelope) -> Response {
  let start = Instant::now();
  let _active = ActiveGuard::enter(deps.path);

  let record = |label: &str| {
    metrics()
      .duration
      .with_label_values(&[deps.path, label])
      .observe(start.elapsed().as_secs_f64());
  };

  let mut stdin = deps.buffers.get();
  if let Err(err) = serde_json::to_writer(&mut stdin, &envelope) {
    error!("Failed to marshal request envelope: {err}");
    record("500");
    return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
  }

  let guard = match deps.pool.checkout().await {
    Ok(guard) => guard,
    Err(err) => {
      error!("Worker pool unavailable: {err}");
      record("500");
      return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }
  };

  let timeout = deps.timeout;
  let joined = tokio::task::spawn_blocking(move || {
    let outcome = guard.execute(&stdin, timeout);
    // Pair returns to the pool here, before response handling.
    drop(guard);
    (outcome, stdin)
  })
  .await;

  let outcome = match joined {
    Ok((outcome, stdin)) => {
      deps.buffers.put(stdin);
      outcome
    }
    Err(err) => {
      error!("Execution task panicked: {err}");
      record("500");
      return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }
  };

  let output = match outcome {
    Ok(output) => output,
    Err(ExecError::DeadlineExceeded { stderr }) => {
      warn!("Function '{}' exceeded its deadline of {timeout:?}", deps.path);
      log_guest_stderr(deps.path, &stderr);
      record("504");
      return plain_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
    }
    Err(ExecError::Guest { message, stderr }) => {
      error!("Function '{}' failed: {message}", deps.path);
      log_guest_stderr(deps.path, &stderr);
      record("500");
      return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }
  };

  log_guest_stderr(deps.path, &output.stderr);

  if output.stdout.is_empty() {
    error!("Function '{}' crashed without writing a response envelope", deps.path);
    record("500");
    return plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
  }

  let response: ResponseEnvelope = match serde_json::from_slice(&output.stdout) {
    Ok(response) => response,
    Err(err) => {
      error!("Function '{}' wrote an unparsable response envelope: {err}", deps.path);
      record("502");
      return plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
    }
  };

  let status = response.effective_status();
  record(&status.to_string());

  let mut http_response = Response::new(Body::from(response.body));
  *http_response.status_mut() = StatusCode::from_u16(status).unwrap_or_else(|_| {
    warn!("Guest returned out-of-range status {status}; coercing to 200");
    return StatusCode::OK;
  });

  let response_headers = http_response.headers_mut();
  for (name, values) in &response.headers {
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
      warn!("Dropping invalid response header name '{name}'");
      continue;
    };
    for value in values {
      match HeaderValue::from_str(value) {
        Ok(value) => {
          response_headers.append(name.clone(), value);
        }
        Err(_) => warn!("Dropping invalid response header value for '{name}'"),
      }
    }
  }

  return http_response;
}

/// Raw one-shot execution used by the tool surface: `input` on stdin,
/// stdout returned verbatim.
pub(crate) async fn execute_raw(deps: SyncDeps<'_>, input: Vec<u8>) -> Result<String, String> {
  let guard = deps.pool.checkout().await.map_err(|err| err.to_string())?;

  let timeout = deps.timeout;
  let outcome = tokio::task::spawn_blocking(move || {
    let outcome = guard.execute(&input, timeout);
    drop(guard);
    outcome
  })
  .await
  .map_err(|err| err.to_string())?;

  return match outcome {
    Ok(output) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
    Err(err) => Err(format!("wasm sync execution failed: {} | stderr: {}", err.message(), err.stderr())),
  };
}

fn log_guest_stderr(path: &str, stderr: &str) {
  if !stderr.is_empty() {
    info!("[guest stderr {path}] {}", stderr.trim_end());
  }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response {
  return (status, body).into_response();
}
