//! `ping` built-in: in-process fast-path module (§8 scenario F).
//!
//! Grounded on ansible.builtin.ping's contract: echo back `data` (default
//! `"pong"`), or fail deliberately when `data == "crash"` so callers can
//! exercise the failure path without touching the filesystem or network.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::gate::resident::FastPathModule;

pub struct Ping;

#[async_trait::async_trait]
impl FastPathModule for Ping {
    async fn run(&self, args: &Value) -> Result<Value> {
        let data = args.get("data").and_then(Value::as_str).unwrap_or("pong");
        if data == "crash" {
            return Err(Error::ModuleExecution {
                module: "ping".to_string(),
                host: "local".to_string(),
                message: "requested crash".to_string(),
            });
        }
        Ok(json!({"ping": data}))
    }
}
