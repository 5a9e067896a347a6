use log::*;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::broker::{Broker, BrokerError};
use crate::envelope::RequestEnvelope;

/// W3C trace-context header carried in broker message headers (text-map
/// propagation across the queue).
pub(crate) const TRACEPARENT_HEADER: &str = "traceparent";

/// Wrap `payload` in an ASYNC job envelope and durably publish it on the
/// target module's subject. Returns the stream sequence.
pub(crate) fn publish_async_job(
  broker: &Broker,
  wasm_file: &str,
  payload: &str,
  traceparent: Option<String>,
) -> Result<u64, BrokerError> {
  let subject = crate::function_subject(wasm_file);
  let traceparent = traceparent.unwrap_or_else(generate_traceparent);

  let envelope = RequestEnvelope {
    method: "ASYNC".to_string(),
    uri: "internal://async/job".to_string(),
    headers: HashMap::from([("X-Source".to_string(), vec!["internal".to_string()])]),
    body: payload.to_string(),
    trace_id: traceparent.clone(),
  };
  let job_bytes = serde_json::to_vec(&envelope)
    .map_err(|err| BrokerError::Storage(format!("job envelope encode: {err}")))?;

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or(0);
  let msg_id = format!("job_{nanos}");

  let headers = HashMap::from([(TRACEPARENT_HEADER.to_string(), traceparent.clone())]);

  let seq = broker.publish(&subject, &job_bytes, Some(&msg_id), headers)?;
  info!("Async job persisted and queued (file '{wasm_file}', msg_id {msg_id}, trace {traceparent})");
  return Ok(seq);
}

/// Payload published by cron triggers.
pub(crate) fn cron_payload() -> String {
  return r#"{"event_type": "cron", "source": "scheduler"}"#.to_string();
}

/// Fresh W3C traceparent: version 00, random trace/span ids, sampled.
pub(crate) fn generate_traceparent() -> String {
  let mut trace_id = [0u8; 16];
  let mut span_id = [0u8; 8];
  let mut rng = rand::rng();
  rng.fill_bytes(&mut trace_id);
  rng.fill_bytes(&mut span_id);
  return format!("00-{}-{}-01", hex::encode(trace_id), hex::encode(span_id));
}
