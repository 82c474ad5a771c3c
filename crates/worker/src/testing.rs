//! Built-in `testing.*` actions
//!
//! Small, deterministic actions used to exercise the pool end to end: argument
//! handling, failures, panics, slow I/O, CPU-bound work and each sandbox
//! dimension.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Number, Value};

use crate::action::{
    optional_arg, required_arg, Action, ActionContext, ActionError, StaticActionRegistry,
};
use crate::sandbox::Capability;

/// Register every testing action
pub fn register_all(registry: &mut StaticActionRegistry) {
    registry
        .register(AddHundred)
        .register(Echo)
        .register(Sleep)
        .register(Fail)
        .register(Panic)
        .register(Spin)
        .register(WriteFile)
        .register(ReadFile)
        .register(Fetch)
        .register(Spawn)
        .register(Context);
}

/// Registry containing only the testing actions
pub fn registry() -> StaticActionRegistry {
    let mut registry = StaticActionRegistry::new();
    register_all(&mut registry);
    registry
}

/// `{num}` -> `num + 100`
pub struct AddHundred;

#[async_trait]
impl Action for AddHundred {
    fn name(&self) -> &str {
        "testing.add_100"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let num: Number = required_arg(&args, "num")?;
        if let Some(n) = num.as_i64() {
            return n
                .checked_add(100)
                .map(|sum| json!(sum))
                .ok_or_else(|| ActionError::failed("integer overflow"));
        }
        let f = num
            .as_f64()
            .ok_or_else(|| ActionError::invalid_args("'num' is not representable"))?;
        Ok(json!(f + 100.0))
    }
}

/// Returns its arguments unchanged
pub struct Echo;

#[async_trait]
impl Action for Echo {
    fn name(&self) -> &str {
        "testing.echo"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        Ok(Value::Object(args))
    }
}

/// `{seconds}` -> sleeps without blocking the worker loop
pub struct Sleep;

#[async_trait]
impl Action for Sleep {
    fn name(&self) -> &str {
        "testing.sleep"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let seconds: f64 = required_arg(&args, "seconds")?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ActionError::invalid_args("'seconds' must be a non-negative number"));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(json!({ "slept": seconds }))
    }
}

/// `{message}` -> always fails
pub struct Fail;

#[async_trait]
impl Action for Fail {
    fn name(&self) -> &str {
        "testing.fail"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let message: Option<String> = optional_arg(&args, "message")?;
        Err(ActionError::failed(message.unwrap_or_else(|| "requested failure".to_string()))
            .with_detail(json!({ "args": args })))
    }
}

/// Panics inside the action
pub struct Panic;

#[async_trait]
impl Action for Panic {
    fn name(&self) -> &str {
        "testing.panic"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        _args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        panic!("testing.panic invoked");
    }
}

/// `{millis}` -> busy loop; blocks the worker's cooperative loop meanwhile
pub struct Spin;

#[async_trait]
impl Action for Spin {
    fn name(&self) -> &str {
        "testing.spin"
    }

    async fn call(
        &self,
        _ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let millis: u64 = required_arg(&args, "millis")?;
        let started = Instant::now();
        let mut iterations: u64 = 0;
        while started.elapsed() < Duration::from_millis(millis) {
            iterations = iterations.wrapping_add(1);
            std::hint::spin_loop();
        }
        Ok(json!({ "iterations": iterations }))
    }
}

/// `{path, content}` -> writes a file through the sandbox-checked context
pub struct WriteFile;

#[async_trait]
impl Action for WriteFile {
    fn name(&self) -> &str {
        "testing.write_file"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Filesystem]
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let path: String = required_arg(&args, "path")?;
        let content: String = optional_arg(&args, "content")?.unwrap_or_default();
        ctx.write_file(&path, content.as_bytes()).await?;
        Ok(json!({ "path": path, "bytes": content.len() }))
    }
}

/// `{path}` -> file contents as UTF-8 (lossy)
pub struct ReadFile;

#[async_trait]
impl Action for ReadFile {
    fn name(&self) -> &str {
        "testing.read_file"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Filesystem]
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let path: String = required_arg(&args, "path")?;
        let bytes = ctx.read_file(&path).await?;
        Ok(json!(String::from_utf8_lossy(&bytes)))
    }
}

/// `{host, port}` -> opens (and closes) a TCP connection
pub struct Fetch;

#[async_trait]
impl Action for Fetch {
    fn name(&self) -> &str {
        "testing.fetch"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Network]
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let host: String = required_arg(&args, "host")?;
        let port: u16 = required_arg(&args, "port")?;
        let stream = ctx.connect(&host, port).await?;
        let peer = stream.peer_addr()?;
        Ok(json!({ "connected": true, "peer": peer.to_string() }))
    }
}

/// `{program, args}` -> runs a subprocess, returns exit code and stdout
pub struct Spawn;

#[async_trait]
impl Action for Spawn {
    fn name(&self) -> &str {
        "testing.spawn"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Subprocess]
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let program: String = required_arg(&args, "program")?;
        let argv: Vec<String> = optional_arg(&args, "args")?.unwrap_or_default();
        let output = ctx.command(&program)?.args(&argv).output().await?;
        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
        }))
    }
}

/// Reports the run identifiers and which credential keys the request carried
pub struct Context;

#[async_trait]
impl Action for Context {
    fn name(&self) -> &str {
        "testing.context"
    }

    async fn call(
        &self,
        ctx: &ActionContext,
        _args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let mut keys: Vec<&String> = ctx.run.credentials.keys().collect();
        keys.sort();
        Ok(json!({
            "request_id": ctx.request_id,
            "workspace_id": ctx.run.workspace_id,
            "workflow_id": ctx.run.workflow_id,
            "run_id": ctx.run.run_id,
            "credential_keys": keys,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn ctx() -> ActionContext {
        ActionContext::unrestricted(Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_add_100() {
        let out = AddHundred.call(&ctx(), args(json!({"num": 5}))).await.unwrap();
        assert_eq!(out, json!(105));

        let out = AddHundred.call(&ctx(), args(json!({"num": 0.5}))).await.unwrap();
        assert_eq!(out, json!(100.5));
    }

    #[tokio::test]
    async fn test_add_100_missing_arg() {
        let err = AddHundred.call(&ctx(), Map::new()).await.unwrap_err();
        assert!(matches!(err, ActionError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_fail_carries_message() {
        let err = Fail
            .call(&ctx(), args(json!({"message": "nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let path_str = path.to_string_lossy().to_string();

        WriteFile
            .call(&ctx(), args(json!({"path": path_str, "content": "ok"})))
            .await
            .unwrap();
        let out = ReadFile
            .call(&ctx(), args(json!({"path": path_str})))
            .await
            .unwrap();
        assert_eq!(out, json!("ok"));
    }

    #[test]
    fn test_registry_contains_all() {
        let registry = registry();
        assert_eq!(registry.len(), 11);
        assert!(crate::ActionRegistry::resolve(&registry, "testing.add_100").is_some());
    }
}
