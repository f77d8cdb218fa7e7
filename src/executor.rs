//! Task executors: LLM client, tool registry, handler map
//!
//! Executors receive fully-resolved input and return raw values; the runner
//! normalizes whatever comes back into the standard envelope. Registries are
//! built once and frozen before the run starts, so dispatch never takes a
//! lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::instrument;

use crate::envelope::TaskEnvelope;
use crate::error::WeftError;
use crate::task::{Task, TaskAction};

/// One-shot completion client for `llm:` tasks
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Value, WeftError>;
}

/// Deterministic client for tests and dry runs: echoes the prompt back
#[derive(Debug, Default, Clone)]
pub struct MockLlm;

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<Value, WeftError> {
        Ok(json!({
            "text": format!("mock response to: {prompt}"),
            "model": model.unwrap_or("mock"),
        }))
    }
}

/// An async tool or handler function: resolved input in, raw value out
pub type TaskFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, WeftError>> + Send + Sync>;

/// Mutable registration phase for named tools
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, TaskFn>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async tool under a name; later registrations win
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, WeftError>> + Send + 'static,
    {
        self.tools
            .insert(name.into(), Arc::new(move |input| Box::pin(f(input))));
        self
    }

    /// Freeze into an immutable snapshot
    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}

/// Immutable tool snapshot shared across the run
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, TaskFn>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&TaskFn> {
        self.tools.get(name)
    }
}

/// Mutable registration phase for inline handlers
#[derive(Default)]
pub struct HandlerMapBuilder {
    handlers: HashMap<String, TaskFn>,
}

impl HandlerMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, WeftError>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |input| Box::pin(f(input))));
        self
    }

    pub fn build(self) -> HandlerMap {
        HandlerMap {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable handler snapshot
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: Arc<HashMap<String, TaskFn>>,
}

impl HandlerMap {
    pub fn builder() -> HandlerMapBuilder {
        HandlerMapBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&TaskFn> {
        self.handlers.get(name)
    }
}

/// Input after template resolution: the data object plus, for `llm:` tasks,
/// the resolved prompt.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub input: Value,
    pub prompt: Option<String>,
}

/// Everything the runner needs to execute any task kind
#[derive(Clone)]
pub struct ExecutorSet {
    pub llm: Arc<dyn LlmClient>,
    pub tools: ToolRegistry,
    pub handlers: HandlerMap,
}

impl Default for ExecutorSet {
    fn default() -> Self {
        Self {
            llm: Arc::new(MockLlm),
            tools: ToolRegistry::default(),
            handlers: HandlerMap::default(),
        }
    }
}

impl ExecutorSet {
    /// Run one attempt of a task and normalize the outcome
    ///
    /// Executor failures become failed envelopes, never an `Err` - the
    /// retry/propagation decision belongs to the runner.
    #[instrument(skip(self, resolved), fields(task_id = %task.id, kind = %task.kind()))]
    pub async fn invoke(&self, task: &Task, resolved: ResolvedInput) -> TaskEnvelope {
        let raw = match &task.action {
            TaskAction::Llm { llm } => {
                let prompt = resolved.prompt.as_deref().unwrap_or(&llm.prompt);
                self.llm.complete(prompt, llm.model.as_deref()).await
            }
            TaskAction::Tool { tool } => match self.tools.get(&tool.name) {
                Some(f) => f(resolved.input).await,
                None => Err(WeftError::ToolNotFound {
                    name: tool.name.clone(),
                }),
            },
            TaskAction::Handler { handler } => match self.handlers.get(&handler.name) {
                Some(f) => f(resolved.input).await,
                None => Err(WeftError::HandlerNotFound {
                    name: handler.name.clone(),
                }),
            },
        };

        match raw {
            Ok(value) => TaskEnvelope::from_raw(value),
            Err(err) => TaskEnvelope::failed(&err),
        }
    }
}
