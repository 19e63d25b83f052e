use async_trait::async_trait;
use std::time::Duration;
use task_queue_engine::{HandlerRegistry, TaskHandler, TaskResult};

/// Register the demo handlers under their task names
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register("echo", EchoHandler);
    registry.register("sleep", SleepHandler::new(Duration::from_millis(100)));
    registry.register("json_processor", JsonProcessorHandler);
}

/// Returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, payload: Vec<u8>) -> TaskResult {
        Ok(payload)
    }
}

/// Simulates work by sleeping
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        SleepHandler { duration }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, payload: Vec<u8>) -> TaskResult {
        tokio::time::sleep(self.duration).await;
        Ok(payload)
    }
}

/// Wraps a JSON payload with a key count. Invalid JSON fails the attempt.
pub struct JsonProcessorHandler;

#[async_trait]
impl TaskHandler for JsonProcessorHandler {
    async fn execute(&self, payload: Vec<u8>) -> TaskResult {
        let json: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| format!("Invalid JSON: {}", e))?;

        let result = match json.as_object() {
            Some(obj) => serde_json::json!({
                "key_count": obj.len(),
                "original": json,
            }),
            None => serde_json::json!({ "original": json }),
        };

        serde_json::to_vec(&result).map_err(|e| format!("Failed to serialize result: {}", e))
    }
}
