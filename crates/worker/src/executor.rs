//! Action executor
//!
//! Resolves an action by name, invokes it through the active sandbox policy
//! and turns every outcome (value, failure, violation, panic, deadline) into
//! an [`ExecutionResult`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, warn};

use warmpool_protocol::{ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult};

use crate::action::{ActionContext, ActionError, ActionRegistry};
use crate::sandbox::{ActionFuture, SandboxPolicy};

pub struct ActionExecutor {
    registry: Arc<dyn ActionRegistry>,
    policy: SandboxPolicy,
}

impl ActionExecutor {
    pub fn new(registry: Arc<dyn ActionRegistry>, policy: SandboxPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<dyn ActionRegistry> {
        &self.registry
    }

    /// Run one request to completion. Never fails: every outcome is a result.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let request_id = request.request_id;

        let outcome = self.invoke(request).await;
        let duration = started.elapsed();

        match outcome {
            Ok(payload) => ExecutionResult::success(request_id, payload, duration),
            Err(error) => ExecutionResult::failure(request_id, error, duration),
        }
    }

    async fn invoke(&self, request: ExecutionRequest) -> Result<serde_json::Value, ExecutionError> {
        let ExecutionRequest {
            request_id,
            action_name,
            args,
            context,
            deadline,
            ..
        } = request;

        let Some(action) = self.registry.resolve(&action_name) else {
            debug!(%request_id, action = %action_name, "Unknown action");
            return Err(ExecutionError::new(
                ErrorKind::ActionExecutionError,
                format!("unknown action: {}", action_name),
            ));
        };

        self.policy
            .preflight(action.as_ref())
            .map_err(|violation| map_action_error(ActionError::Violation(violation)))?;

        let ctx = ActionContext::new(request_id, context, deadline, self.policy.guard());
        let invocation: ActionFuture<'_> =
            Box::pin(AssertUnwindSafe(action.call(&ctx, args)).catch_unwind().map(
                |caught| match caught {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(ActionError::failed(format!(
                        "action panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                },
            ));

        // The caller enforces the deadline; the worker stops waiting at the
        // same point so abandoned work cannot pile up.
        match tokio::time::timeout(deadline, self.policy.enforce(invocation)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(map_action_error(error)),
            Err(_) => {
                warn!(
                    %request_id,
                    action = %action_name,
                    ?deadline,
                    "Action exceeded its deadline"
                );
                Err(ExecutionError::new(
                    ErrorKind::TimeoutError,
                    format!("action did not finish within {:?}", deadline),
                ))
            }
        }
    }
}

fn map_action_error(error: ActionError) -> ExecutionError {
    match error {
        ActionError::Failed { message, detail } => {
            let error = ExecutionError::new(ErrorKind::ActionExecutionError, message);
            match detail {
                Some(detail) => error.with_detail(detail),
                None => error,
            }
        }
        ActionError::Violation(violation) => {
            ExecutionError::new(ErrorKind::SandboxViolation, violation.to_string())
                .with_detail(violation.detail())
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxRules;
    use crate::testing;
    use serde_json::json;
    use std::time::Duration;
    use warmpool_protocol::ExecutionStatus;

    fn executor(policy: SandboxPolicy) -> ActionExecutor {
        ActionExecutor::new(Arc::new(testing::registry()), policy)
    }

    #[tokio::test]
    async fn test_add_100() {
        let request = ExecutionRequest::new("testing.add_100")
            .with_args(json!({"num": 5}))
            .with_deadline(Duration::from_secs(5));
        let request_id = request.request_id;

        let result = executor(SandboxPolicy::Unrestricted).execute(request).await;

        assert_eq!(result.request_id, request_id);
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.payload, Some(json!(105)));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let result = executor(SandboxPolicy::Unrestricted)
            .execute(ExecutionRequest::new("testing.unknown_action"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_kind(), Some(ErrorKind::ActionExecutionError));
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn test_panic_becomes_action_error() {
        let result = executor(SandboxPolicy::Unrestricted)
            .execute(ExecutionRequest::new("testing.panic"))
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ActionExecutionError);
        assert!(error.message.contains("testing.panic invoked"));
    }

    #[tokio::test]
    async fn test_failure_detail_preserved() {
        let result = executor(SandboxPolicy::Unrestricted)
            .execute(ExecutionRequest::new("testing.fail").with_arg("message", "bad input"))
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.message, "bad input");
        assert!(error.detail.is_some());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let result = executor(SandboxPolicy::Unrestricted)
            .execute(
                ExecutionRequest::new("testing.sleep")
                    .with_arg("seconds", 5)
                    .with_deadline(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(result.error_kind(), Some(ErrorKind::TimeoutError));
    }

    #[tokio::test]
    async fn test_sandbox_differs_only_in_violation() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        std::fs::create_dir(&allowed).unwrap();
        let target = dir.path().join("forbidden.txt");

        let request = ExecutionRequest::new("testing.write_file")
            .with_args(json!({"path": target.to_string_lossy(), "content": "x"}));

        let unrestricted = executor(SandboxPolicy::Unrestricted)
            .execute(request.clone())
            .await;
        assert!(unrestricted.is_success());
        std::fs::remove_file(&target).unwrap();

        let sandboxed = executor(SandboxPolicy::sandboxed(
            SandboxRules::new().allow_path(&allowed),
        ))
        .execute(request)
        .await;
        assert_eq!(sandboxed.error_kind(), Some(ErrorKind::SandboxViolation));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_denied_capability_checked_before_invocation() {
        let result = executor(SandboxPolicy::sandboxed(SandboxRules::default()))
            .execute(
                ExecutionRequest::new("testing.spawn").with_args(json!({"program": "true"})),
            )
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::SandboxViolation);
        assert_eq!(error.detail.unwrap()["capability"], json!("subprocess"));
    }
}
