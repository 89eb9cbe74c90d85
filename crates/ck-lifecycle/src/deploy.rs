//! Post-renewal deploy fan-out.
//!
//! The engine only owns the dispatch contract: actions run sequentially, a
//! failure aborts the rest unless the action says `runOnFailure: continue`.
//! Concrete transports (reverse-proxy upload, container restart, scp, mail)
//! are adapters registered from outside the core.

use async_trait::async_trait;
use ck_registry::{DeployAction, FailurePolicy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default per-action timeout.
const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// What an adapter gets to work with: the renewed certificate's identity and
/// its post-renewal file set.
#[derive(Debug, Clone)]
pub struct DeployContext {
    pub certificate_name: String,
    pub fingerprint: String,
    pub files: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployActionResult {
    pub action: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub success: bool,
    pub results: Vec<DeployActionResult>,
}

/// One deploy transport. Implementations should be idempotent where
/// feasible; the dispatcher may re-run actions after partial failures.
#[async_trait]
pub trait DeployAdapter: Send + Sync {
    async fn run(&self, action: &DeployAction, ctx: &DeployContext) -> DeployActionResult;
}

/// Fallback adapter: records the intent and succeeds. Lets renewals proceed
/// on hosts where no transport is wired up.
pub struct LogOnlyAdapter;

#[async_trait]
impl DeployAdapter for LogOnlyAdapter {
    async fn run(&self, action: &DeployAction, ctx: &DeployContext) -> DeployActionResult {
        info!(
            action = action.kind.label(),
            certificate = %ctx.certificate_name,
            "no adapter registered, deploy action logged only"
        );
        DeployActionResult {
            action: action.kind.label().to_string(),
            success: true,
            message: format!("{} logged (no adapter registered)", action.kind.label()),
            detail: None,
        }
    }
}

pub struct DeployDispatcher {
    adapters: HashMap<&'static str, Arc<dyn DeployAdapter>>,
    fallback: Arc<dyn DeployAdapter>,
    action_timeout: Duration,
}

impl Default for DeployDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DeployDispatcher {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            fallback: Arc::new(LogOnlyAdapter),
            action_timeout: ACTION_TIMEOUT,
        }
    }

    /// Register an adapter for an action kind label
    /// (`restartContainer`, `uploadToProxy`, `sshPush`, `email`).
    pub fn register(&mut self, kind: &'static str, adapter: Arc<dyn DeployAdapter>) {
        self.adapters.insert(kind, adapter);
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Run the actions in order. A failed action aborts the remainder
    /// unless it carries `runOnFailure: continue`.
    pub async fn dispatch(&self, actions: &[DeployAction], ctx: &DeployContext) -> DeployReport {
        let mut report = DeployReport {
            success: true,
            results: Vec::with_capacity(actions.len()),
        };

        for action in actions {
            let adapter = self
                .adapters
                .get(action.kind.label())
                .unwrap_or(&self.fallback);

            let result = match tokio::time::timeout(self.action_timeout, adapter.run(action, ctx))
                .await
            {
                Ok(result) => result,
                Err(_) => DeployActionResult {
                    action: action.kind.label().to_string(),
                    success: false,
                    message: format!(
                        "timed out after {}s",
                        self.action_timeout.as_secs()
                    ),
                    detail: None,
                },
            };

            let failed = !result.success;
            if failed {
                warn!(
                    action = %result.action,
                    certificate = %ctx.certificate_name,
                    message = %result.message,
                    "deploy action failed"
                );
                report.success = false;
            }
            report.results.push(result);

            if failed && action.run_on_failure != FailurePolicy::Continue {
                break;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_registry::DeployActionKind;
    use std::sync::Mutex;

    struct RecordingAdapter {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl DeployAdapter for RecordingAdapter {
        async fn run(&self, action: &DeployAction, _ctx: &DeployContext) -> DeployActionResult {
            self.calls
                .lock()
                .unwrap()
                .push(action.kind.label().to_string());
            DeployActionResult {
                action: action.kind.label().to_string(),
                success: !self.fail,
                message: if self.fail { "boom".into() } else { "ok".into() },
                detail: None,
            }
        }
    }

    fn ctx() -> DeployContext {
        DeployContext {
            certificate_name: "web".to_string(),
            fingerprint: "ab".repeat(32),
            files: BTreeMap::new(),
        }
    }

    fn restart(policy: FailurePolicy) -> DeployAction {
        DeployAction {
            kind: DeployActionKind::RestartContainer {
                container: "nginx".to_string(),
            },
            run_on_failure: policy,
        }
    }

    fn email(policy: FailurePolicy) -> DeployAction {
        DeployAction {
            kind: DeployActionKind::Email {
                recipient: "ops@example.test".to_string(),
            },
            run_on_failure: policy,
        }
    }

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = DeployDispatcher::new();
        dispatcher.register(
            "restartContainer",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );
        dispatcher.register(
            "email",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );

        let report = dispatcher
            .dispatch(
                &[restart(FailurePolicy::Abort), email(FailurePolicy::Abort)],
                &ctx(),
            )
            .await;

        assert!(report.success);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["restartContainer", "email"]
        );
    }

    #[tokio::test]
    async fn test_failure_aborts_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = DeployDispatcher::new();
        dispatcher.register(
            "restartContainer",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: true,
            }),
        );
        dispatcher.register(
            "email",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );

        let report = dispatcher
            .dispatch(
                &[restart(FailurePolicy::Abort), email(FailurePolicy::Abort)],
                &ctx(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.results.len(), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["restartContainer"]);
    }

    #[tokio::test]
    async fn test_run_on_failure_continue() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = DeployDispatcher::new();
        dispatcher.register(
            "restartContainer",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: true,
            }),
        );
        dispatcher.register(
            "email",
            Arc::new(RecordingAdapter {
                calls: Arc::clone(&calls),
                fail: false,
            }),
        );

        let report = dispatcher
            .dispatch(
                &[restart(FailurePolicy::Continue), email(FailurePolicy::Abort)],
                &ctx(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.results.len(), 2);
        assert!(report.results[1].success);
    }

    #[tokio::test]
    async fn test_unregistered_kind_uses_fallback() {
        let dispatcher = DeployDispatcher::new();
        let report = dispatcher
            .dispatch(&[email(FailurePolicy::Abort)], &ctx())
            .await;
        assert!(report.success);
        assert!(report.results[0].message.contains("no adapter"));
    }

    struct SlowAdapter;

    #[async_trait]
    impl DeployAdapter for SlowAdapter {
        async fn run(&self, action: &DeployAction, _ctx: &DeployContext) -> DeployActionResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            DeployActionResult {
                action: action.kind.label().to_string(),
                success: true,
                message: "too late".into(),
                detail: None,
            }
        }
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let mut dispatcher = DeployDispatcher::new().with_timeout(Duration::from_millis(50));
        dispatcher.register("email", Arc::new(SlowAdapter));

        let report = dispatcher
            .dispatch(&[email(FailurePolicy::Abort)], &ctx())
            .await;
        assert!(!report.success);
        assert!(report.results[0].message.contains("timed out"));
    }
}
