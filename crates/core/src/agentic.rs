//! Tool exposure over a JSON-RPC 2.0 message channel, with semantic routing
//! of free-text queries onto the tool.

use log::*;
use serde::{Deserialize, Serialize};

use crate::Engine;
use crate::host::ai::cosine_similarity;

/// Similarity floor for embedding-based routing.
const SEMANTIC_THRESHOLD: f64 = 0.75;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
  #[serde(default)]
  pub jsonrpc: String,
  pub method: String,
  #[serde(default)]
  pub params: serde_json::Value,
  #[serde(default)]
  pub id: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
  pub jsonrpc: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<serde_json::Value>,
  pub id: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ToolDefinition {
  pub name: String,
  pub description: String,
  pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
  #[serde(default)]
  name: String,
  #[serde(default)]
  arguments: serde_json::Value,
}

/// Dispatch one JSON-RPC request against the engine's tool surface.
pub async fn handle_message(engine: &Engine, request: JsonRpcRequest) -> JsonRpcResponse {
  let mut response = JsonRpcResponse {
    jsonrpc: "2.0",
    result: None,
    error: None,
    id: request.id,
  };

  let Some(tool) = engine.config().tool.clone() else {
    return response;
  };

  match request.method.as_str() {
    "tools/list" => {
      let definition = ToolDefinition {
        name: tool.name,
        description: tool.description,
        input_schema: tool.input_schema,
      };
      response.result = Some(serde_json::json!({ "tools": [definition] }));
    }
    "tools/call" => {
      let params: ToolCallParams = match serde_json::from_value(request.params) {
        Ok(params) => params,
        Err(err) => {
          response.error = Some(serde_json::json!({ "message": format!("bad params: {err}") }));
          return response;
        }
      };
      if params.name != tool.name {
        return response;
      }

      let payload = serde_json::to_vec(&params.arguments).unwrap_or_default();
      match engine.run_raw(payload).await {
        Ok(text) => {
          response.result = Some(serde_json::json!({
            "content": [{"type": "text", "text": text}],
          }));
        }
        Err(message) => {
          response.error = Some(serde_json::json!({ "message": message }));
        }
      }
    }
    other => {
      debug!("Ignoring JSON-RPC method '{other}'");
    }
  }

  return response;
}

/// Routing check for a free-text query: substring match on the tool name
/// first, then embedding similarity when an AI backend is configured.
pub async fn semantic_match(engine: &Engine, query: &str) -> bool {
  let Some(ref tool) = engine.config().tool else {
    return false;
  };

  if query.to_lowercase().contains(&tool.name.to_lowercase()) {
    return true;
  }

  let Some(ai) = engine.ai() else {
    return false;
  };

  let query_vec = match ai.embedding(query).await {
    Ok(v) => v,
    Err(err) => {
      error!("Failed to get query embedding: {err}");
      return false;
    }
  };
  let description_vec = match ai.embedding(&tool.description).await {
    Ok(v) => v,
    Err(err) => {
      error!("Failed to get description embedding: {err}");
      return false;
    }
  };

  let similarity = cosine_similarity(&query_vec, &description_vec);
  debug!("Semantic routing check (query '{query}', similarity {similarity})");
  return similarity >= SEMANTIC_THRESHOLD;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, ToolConfig};
  use crate::data_dir::DataDir;
  use crate::runtime::tests::echo_wat;
  use std::sync::atomic::{AtomicU16, Ordering};

  static NEXT_PORT: AtomicU16 = AtomicU16::new(25000);

  async fn tool_engine(dir: &std::path::Path) -> Engine {
    let module = dir.join("tool.wasm");
    std::fs::write(&module, echo_wat(r#"{"ok":true}"#)).expect("write");

    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    let config = Config {
      path: module.to_string_lossy().into_owned(),
      nats_port: port,
      server_name: format!("agentic-test-{port}"),
      pool_size: 1,
      tool: Some(ToolConfig {
        name: "weather".to_string(),
        description: "Returns the weather for a city".to_string(),
        input_schema: serde_json::json!({"type": "object"}),
      }),
      ..Default::default()
    };

    return Engine::provision(config, DataDir(dir.join("data")))
      .await
      .expect("provision");
  }

  fn rpc(method: &str, params: serde_json::Value) -> JsonRpcRequest {
    return JsonRpcRequest {
      jsonrpc: "2.0".to_string(),
      method: method.to_string(),
      params,
      id: serde_json::json!(1),
    };
  }

  #[tokio::test]
  async fn test_tools_list_returns_definition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = tool_engine(dir.path()).await;

    let response = handle_message(&engine, rpc("tools/list", serde_json::Value::Null)).await;
    let result = response.result.expect("result");
    assert_eq!(result["tools"][0]["name"], "weather");
    assert_eq!(result["tools"][0]["description"], "Returns the weather for a city");
    assert!(result["tools"][0]["input_schema"].is_object());

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_tools_call_executes_function() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = tool_engine(dir.path()).await;

    let response = handle_message(
      &engine,
      rpc(
        "tools/call",
        serde_json::json!({"name": "weather", "arguments": {"city": "Lisbon"}}),
      ),
    )
    .await;

    let result = response.result.expect("result");
    assert_eq!(result["content"][0]["type"], "text");
    assert_eq!(result["content"][0]["text"], r#"{"ok":true}"#);
    assert!(response.error.is_none());

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_tools_call_wrong_name_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = tool_engine(dir.path()).await;

    let response = handle_message(
      &engine,
      rpc("tools/call", serde_json::json!({"name": "other", "arguments": {}})),
    )
    .await;
    assert!(response.result.is_none());
    assert!(response.error.is_none());

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_semantic_substring_match_without_ai() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = tool_engine(dir.path()).await;

    assert!(semantic_match(&engine, "what's the Weather in Porto?").await);
    // No AI configured: no embedding fallback.
    assert!(!semantic_match(&engine, "unrelated query").await);

    engine.cleanup().await;
  }
}
