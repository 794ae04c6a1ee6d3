// Tool registry contract
//
// Tools are opaque named callables resolved through this registry. The
// engine never defines tools itself; it dispatches to whatever handler the
// registry returns and treats the output as free-form JSON.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Category tag that switches the poller's default aggregation to `latest`.
pub const HEALTH_CATEGORY: &str = "Health and Wellness";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Execution(String),
}

/// Metadata for a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub returns_schema: Value,
    /// Service this tool belongs to (e.g. "Oura", "Gmail").
    pub service: Option<String>,
}

/// Lookup and dispatch service for tools. Implementations own the handlers;
/// the engine only sees names, schemas and raw return values.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Option<ToolSpec>;

    async fn list(&self, service: Option<&str>) -> Vec<ToolSpec>;

    async fn execute(&self, name: &str, params: Value, owner_id: Uuid) -> Result<Value, ToolError>;

    /// The registry's tagging table: category for a service, if tagged.
    async fn service_category(&self, service: &str) -> Option<String>;
}

pub type ToolHandler =
    Arc<dyn Fn(Value, Uuid) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// In-memory registry. The production deployment wires the real tool
/// catalog in behind the same trait; tests register closures.
#[derive(Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, (ToolSpec, ToolHandler)>,
    categories: HashMap<String, String>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec, handler: ToolHandler) {
        self.tools.insert(spec.name.clone(), (spec, handler));
    }

    /// Register a tool with minimal metadata.
    pub fn register_fn<F, Fut>(&mut self, name: &str, service: Option<&str>, handler: F)
    where
        F: Fn(Value, Uuid) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let spec = ToolSpec {
            name: name.to_string(),
            description: String::new(),
            parameters_schema: Value::Object(serde_json::Map::new()),
            returns_schema: Value::Object(serde_json::Map::new()),
            service: service.map(str::to_string),
        };
        let handler: ToolHandler = Arc::new(move |params, owner| Box::pin(handler(params, owner)));
        self.register(spec, handler);
    }

    pub fn tag_service(&mut self, service: &str, category: &str) {
        self.categories
            .insert(service.to_lowercase(), category.to_string());
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn get_by_name(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|(spec, _)| spec.clone())
    }

    async fn list(&self, service: Option<&str>) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|(spec, _)| spec.clone())
            .filter(|spec| match service {
                Some(s) => spec
                    .service
                    .as_deref()
                    .is_some_and(|svc| svc.eq_ignore_ascii_case(s)),
                None => true,
            })
            .collect()
    }

    async fn execute(&self, name: &str, params: Value, owner_id: Uuid) -> Result<Value, ToolError> {
        let (_, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler(params, owner_id).await
    }

    async fn service_category(&self, service: &str) -> Option<String> {
        self.categories.get(&service.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registry_lookup_and_dispatch() {
        let mut registry = StaticToolRegistry::new();
        registry.register_fn("echo", Some("Test"), |params, _owner| async move {
            Ok(json!({"echo": params}))
        });

        assert!(registry.get_by_name("echo").await.is_some());
        assert!(registry.get_by_name("nope").await.is_none());

        let out = registry
            .execute("echo", json!({"a": 1}), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(out["echo"]["a"], 1);

        let err = registry
            .execute("nope", json!({}), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn service_tagging() {
        let mut registry = StaticToolRegistry::new();
        registry.tag_service("Oura", HEALTH_CATEGORY);
        assert_eq!(
            registry.service_category("oura").await.as_deref(),
            Some(HEALTH_CATEGORY)
        );
        assert_eq!(registry.service_category("slack").await, None);
    }
}
