use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JSON document handed to the guest on stdin. One envelope per execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
  pub method: String,
  pub uri: String,
  #[serde(default)]
  pub headers: HashMap<String, Vec<String>>,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub trace_id: String,
}

/// JSON document the guest must write to stdout. Anything else on stdout is a
/// protocol violation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
  #[serde(default)]
  pub status: u16,
  #[serde(default)]
  pub headers: HashMap<String, Vec<String>>,
  #[serde(default)]
  pub body: String,
}

impl ResponseEnvelope {
  /// Guests that leave `status` unset serialize it as 0.
  pub fn effective_status(&self) -> u16 {
    return if self.status == 0 { 200 } else { self.status };
  }
}
