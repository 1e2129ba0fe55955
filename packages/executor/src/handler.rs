//! Pipeline handlers.
//!
//! A task names its work by an opaque `pipeline_ref`. The registry resolves
//! that reference to a [`TaskHandler`] on the worker side. Handlers must be
//! idempotent: the same input and parameters always yield the same output,
//! since a task may run more than once.

use jobplane_types::{async_trait, bytes::Bytes, anyhow, Result, TaskId};
use std::collections::HashMap;
use std::sync::Arc;

pub const ECHO: &str = "builtin/echo";
pub const UPPERCASE: &str = "builtin/uppercase";
pub const CHECKSUM: &str = "builtin/checksum";

#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: TaskId,
    pub attempt: u32,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &HandlerContext, input: Bytes) -> Result<Bytes>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ECHO, EchoHandler);
        registry.register(UPPERCASE, UppercaseHandler);
        registry.register(CHECKSUM, ChecksumHandler);
        registry
    }

    pub fn register(&mut self, pipeline_ref: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(pipeline_ref.into(), Arc::new(handler));
    }

    pub fn get(&self, pipeline_ref: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(pipeline_ref).cloned()
    }

    pub fn contains(&self, pipeline_ref: &str) -> bool {
        self.handlers.contains_key(pipeline_ref)
    }
}

/// Copies the input to the output unchanged.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, _ctx: &HandlerContext, input: Bytes) -> Result<Bytes> {
        Ok(input)
    }
}

/// Upper-cases UTF-8 input.
pub struct UppercaseHandler;

#[async_trait]
impl TaskHandler for UppercaseHandler {
    async fn run(&self, _ctx: &HandlerContext, input: Bytes) -> Result<Bytes> {
        let text = std::str::from_utf8(&input).map_err(|e| anyhow!("Input is not UTF-8: {}", e))?;
        Ok(Bytes::from(text.to_uppercase()))
    }
}

/// Writes a JSON document with the BLAKE3 digest and size of the input.
pub struct ChecksumHandler;

#[async_trait]
impl TaskHandler for ChecksumHandler {
    async fn run(&self, _ctx: &HandlerContext, input: Bytes) -> Result<Bytes> {
        let digest = blake3::hash(&input);
        let body = serde_json::json!({
            "algorithm": "blake3",
            "digest": digest.to_hex().to_string(),
            "size": input.len(),
        });
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}
