//! Action abstractions
//!
//! Actions are named units of externally registered logic. The worker
//! resolves them by name from an [`ActionRegistry`] and invokes them with the
//! request's arguments and a fresh [`ActionContext`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use warmpool_protocol::RunContext;

use crate::sandbox::{Capability, CapabilityGuard, FsOperation, SandboxViolation};

// =============================================================================
// Errors
// =============================================================================

/// Failure reported by an action
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    /// The action ran and failed
    #[error("{message}")]
    Failed {
        message: String,
        detail: Option<Value>,
    },

    /// The sandbox prevented the action from running as requested
    #[error(transparent)]
    Violation(#[from] SandboxViolation),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach detail to a `Failed` error; violations carry their own detail
    pub fn with_detail(self, value: Value) -> Self {
        match self {
            Self::Failed { message, .. } => Self::Failed {
                message,
                detail: Some(value),
            },
            violation => violation,
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::failed(format!("invalid arguments: {}", message.into()))
    }
}

impl From<std::io::Error> for ActionError {
    fn from(err: std::io::Error) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed(err.to_string())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Context handed to an action for exactly one request.
///
/// All filesystem, network, environment and subprocess access should go
/// through these helpers so the active sandbox policy can see it. The context
/// is dropped when the request completes; nothing in it outlives the call.
#[derive(Debug)]
pub struct ActionContext {
    /// Request being served
    pub request_id: Uuid,

    /// Run identifiers and credentials from the request
    pub run: RunContext,

    /// Deadline the caller attached to this request
    pub deadline: Duration,

    guard: CapabilityGuard,
}

impl ActionContext {
    pub fn new(
        request_id: Uuid,
        run: RunContext,
        deadline: Duration,
        guard: CapabilityGuard,
    ) -> Self {
        Self {
            request_id,
            run,
            deadline,
            guard,
        }
    }

    /// Context with no sandbox restrictions
    pub fn unrestricted(request_id: Uuid) -> Self {
        Self::new(
            request_id,
            RunContext::default(),
            Duration::from_secs(60),
            CapabilityGuard::unrestricted(),
        )
    }

    pub fn is_sandboxed(&self) -> bool {
        self.guard.is_sandboxed()
    }

    /// Fail with a sandbox violation unless `capability` is permitted
    pub fn require(&self, capability: Capability) -> Result<(), ActionError> {
        self.guard.require(capability).map_err(ActionError::from)
    }

    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, ActionError> {
        let path = self.guard.check_path(path.as_ref(), FsOperation::Read)?;
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), ActionError> {
        let path = self.guard.check_path(path.as_ref(), FsOperation::Write)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Check egress without connecting, for actions that bring their own client
    pub fn check_egress(&self, host: &str, port: u16) -> Result<(), ActionError> {
        self.guard.check_egress(host, port).map_err(ActionError::from)
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio::net::TcpStream, ActionError> {
        self.check_egress(host, port)?;
        Ok(tokio::net::TcpStream::connect((host, port)).await?)
    }

    pub fn env_var(&self, name: &str) -> Result<Option<String>, ActionError> {
        self.require(Capability::Environment)?;
        Ok(std::env::var(name).ok())
    }

    pub fn command(
        &self,
        program: impl AsRef<std::ffi::OsStr>,
    ) -> Result<tokio::process::Command, ActionError> {
        self.require(Capability::Subprocess)?;
        let mut command = tokio::process::Command::new(program);
        command.kill_on_drop(true);
        Ok(command)
    }
}

// =============================================================================
// Action trait
// =============================================================================

/// A named, externally registered unit of logic
///
/// # Example
///
/// ```ignore
/// struct Greet;
///
/// #[async_trait]
/// impl Action for Greet {
///     fn name(&self) -> &str {
///         "demo.greet"
///     }
///
///     async fn call(
///         &self,
///         _ctx: &ActionContext,
///         args: Map<String, Value>,
///     ) -> Result<Value, ActionError> {
///         let name = required_arg::<String>(&args, "name")?;
///         Ok(json!(format!("hello {}", name)))
///     }
/// }
/// ```
#[async_trait]
pub trait Action: Send + Sync + 'static {
    /// Registry key
    fn name(&self) -> &str;

    /// Capabilities the action needs; checked before invocation when sandboxed
    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError>;
}

/// Read and deserialize a required argument
pub fn required_arg<T: DeserializeOwned>(
    args: &Map<String, Value>,
    name: &str,
) -> Result<T, ActionError> {
    let value = args
        .get(name)
        .ok_or_else(|| ActionError::invalid_args(format!("missing '{}'", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ActionError::invalid_args(format!("'{}': {}", name, e)))
}

/// Read and deserialize an optional argument
pub fn optional_arg<T: DeserializeOwned>(
    args: &Map<String, Value>,
    name: &str,
) -> Result<Option<T>, ActionError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| ActionError::invalid_args(format!("'{}': {}", name, e))),
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Resolves action names to callables
pub trait ActionRegistry: Send + Sync {
    fn resolve(&self, action_name: &str) -> Option<Arc<dyn Action>>;

    /// Registered names, sorted
    fn names(&self) -> Vec<String>;
}

type ActionFn = Arc<
    dyn Fn(
            Map<String, Value>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, ActionError>> + Send>>
        + Send
        + Sync,
>;

/// Adapter so plain async closures can be registered
struct FnAction {
    name: String,
    handler: ActionFn,
}

#[async_trait]
impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        (self.handler)(args).await
    }
}

/// In-memory registry populated at worker startup
#[derive(Default, Clone)]
pub struct StaticActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl StaticActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Action) -> &mut Self {
        self.actions
            .insert(action.name().to_string(), Arc::new(action));
        self
    }

    /// Register an async closure that only needs the arguments
    pub fn register_fn<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        let handler: ActionFn = Arc::new(move |args| Box::pin(handler(args)));
        self.actions.insert(
            name.to_string(),
            Arc::new(FnAction {
                name: name.to_string(),
                handler,
            }),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl ActionRegistry for StaticActionRegistry {
    fn resolve(&self, action_name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(action_name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_fn_and_resolve() {
        let mut registry = StaticActionRegistry::new();
        registry.register_fn("math.double", |args| async move {
            let n: i64 = required_arg(&args, "n")?;
            Ok::<Value, ActionError>(json!(n * 2))
        });

        let action = registry.resolve("math.double").unwrap();
        let ctx = ActionContext::unrestricted(Uuid::now_v7());
        let mut args = Map::new();
        args.insert("n".into(), json!(21));

        assert_eq!(action.call(&ctx, args).await.unwrap(), json!(42));
        assert!(registry.resolve("math.triple").is_none());
        assert_eq!(registry.names(), vec!["math.double".to_string()]);
    }

    #[test]
    fn test_required_arg_errors() {
        let mut args = Map::new();
        args.insert("num".into(), json!("five"));

        let missing = required_arg::<i64>(&args, "other").unwrap_err();
        assert!(missing.to_string().contains("missing 'other'"));

        let wrong_type = required_arg::<i64>(&args, "num").unwrap_err();
        assert!(wrong_type.to_string().contains("'num'"));
    }

    #[test]
    fn test_optional_arg() {
        let mut args = Map::new();
        args.insert("a".into(), json!(1));
        args.insert("b".into(), Value::Null);

        assert_eq!(optional_arg::<i64>(&args, "a").unwrap(), Some(1));
        assert_eq!(optional_arg::<i64>(&args, "b").unwrap(), None);
        assert_eq!(optional_arg::<i64>(&args, "c").unwrap(), None);
    }

    #[test]
    fn test_with_detail_keeps_violation() {
        let violation: ActionError = SandboxViolation::CapabilityDenied {
            capability: Capability::Subprocess,
        }
        .into();
        assert!(matches!(
            violation.with_detail(json!({})),
            ActionError::Violation(_)
        ));
    }
}
