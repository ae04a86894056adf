use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use parley_core::messages::ToolCallRequest;
use parley_core::tools::{Tool, ToolContext, ToolError, ToolOutcome, ToolSchema};

use crate::schema;
use crate::truncate;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed catalog of named tools. Populated at startup and read-only after,
/// so one instance is shared by every session.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            max_output_bytes: truncate::DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas advertised to the model, sorted by name.
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        let mut defs: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve, validate and run one call. Never fails: every problem,
    /// including a panic inside the tool, becomes an error outcome.
    pub async fn invoke(&self, call: &ToolCallRequest, ctx: &ToolContext) -> ToolOutcome {
        let tool = match self.resolve(&call.name) {
            Ok(t) => t,
            Err(e) => return e.into(),
        };

        if call.arguments.is_string() {
            return ToolError::InvalidArguments("arguments are not a JSON object".into()).into();
        }
        if let Err(msg) = schema::validate(&tool.parameters_schema(), &call.arguments) {
            return ToolError::InvalidArguments(msg).into();
        }

        let run = tokio::time::timeout(
            self.timeout,
            std::panic::AssertUnwindSafe(tool.invoke(call.arguments.clone(), ctx)).catch_unwind(),
        );

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
            r = run => match r {
                Ok(Ok(inner)) => inner,
                Ok(Err(panic)) => {
                    let msg = panic_message(&panic);
                    error!(tool = %call.name, call_id = %call.call_id, panic = %msg, "tool panicked during execution");
                    Err(ToolError::InvocationFailed("internal error: tool crashed".into()))
                }
                Err(_) => {
                    warn!(
                        tool = %call.name,
                        call_id = %call.call_id,
                        timeout_secs = self.timeout.as_secs(),
                        "tool timed out"
                    );
                    Err(ToolError::Timeout(self.timeout))
                }
            },
        };

        match result {
            Ok(payload) => ToolOutcome::ok(self.bound_payload(payload)),
            Err(e) => e.into(),
        }
    }

    fn bound_payload(&self, payload: Value) -> Value {
        match payload {
            Value::String(s) if s.len() > self.max_output_bytes => {
                Value::String(truncate::truncate_output(&s, self.max_output_bytes))
            }
            Value::String(s) => Value::String(s),
            other => {
                let rendered = other.to_string();
                if rendered.len() > self.max_output_bytes {
                    Value::String(truncate::truncate_output(&rendered, self.max_output_bytes))
                } else {
                    other
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Text form of an outcome as the model sees it in the next round.
pub fn outcome_text(outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Ok { payload: Value::String(s) } => s.clone(),
        ToolOutcome::Ok { payload } => payload.to_string(),
        ToolOutcome::Error { kind, message } => format!("[error: {}] {message}", kind.as_str()),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
