//! Tool abstraction and registry.
//!
//! Every plan step names a tool. Tools are registered by name in a
//! [`ToolRegistry`] that is handed to the dispatcher at construction time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// A step execution primitive.
///
/// `invoke` receives the step's resolved inputs as a JSON object. Failures
/// should be `Error::ToolFailure` with the right `retryable` flag; any other
/// error is classified by `Error::is_retryable`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Short description, listed by `orca tools`.
    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, input: Value) -> Result<Value>;
}

type BoxedInvoke =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Adapts an async closure into a [`Tool`].
pub struct FnTool {
    name: String,
    description: String,
    invoke: BoxedInvoke,
}

impl FnTool {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: String::new(),
            invoke: Arc::new(move |input| Box::pin(f(input))),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        (self.invoke)(input).await
    }
}

/// Tools by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "Tool registered");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}
