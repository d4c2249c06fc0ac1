use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;

/// Status of the underlying IaaS orchestration stack, as reported by the
/// engine. The strings are the engine's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    UpdateInProgress,
    UpdateComplete,
    UpdateFailed,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::UpdateFailed => "UPDATE_FAILED",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::DeleteFailed => "DELETE_FAILED",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
        }
    }
}

impl FromStr for StackStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value {
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            "UPDATE_IN_PROGRESS" => StackStatus::UpdateInProgress,
            "UPDATE_COMPLETE" => StackStatus::UpdateComplete,
            "UPDATE_FAILED" => StackStatus::UpdateFailed,
            "DELETE_IN_PROGRESS" => StackStatus::DeleteInProgress,
            "DELETE_COMPLETE" => StackStatus::DeleteComplete,
            "DELETE_FAILED" => StackStatus::DeleteFailed,
            "ROLLBACK_IN_PROGRESS" => StackStatus::RollbackInProgress,
            "ROLLBACK_COMPLETE" => StackStatus::RollbackComplete,
            "ROLLBACK_FAILED" => StackStatus::RollbackFailed,
            other => anyhow::bail!("unknown stack status: {other}"),
        };
        Ok(status)
    }
}

/// Snapshot of a stack as observed through the adapter.
#[derive(Debug, Clone)]
pub struct Stack {
    pub stack_id: String,
    pub status: StackStatus,
    pub status_reason: String,
    pub outputs: HashMap<String, Value>,
}

/// Everything the engine needs to build or rebuild a stack.
#[derive(Debug, Clone)]
pub struct StackRequest {
    pub name: String,
    pub parameters: HashMap<String, String>,
    pub template_text: String,
    pub files: HashMap<String, String>,
}

/// Capability wrapped around the external IaaS orchestration engine.
///
/// `stack_id` is opaque to the conductor. `delete_stack` is idempotent:
/// a missing stack deletes successfully. `get_stack` reports a missing
/// stack as `None` rather than an error so the poller can distinguish
/// "externally deleted" from "engine unreachable".
#[async_trait]
pub trait StackAdapter: Send + Sync {
    async fn create_stack(&self, request: StackRequest) -> anyhow::Result<String>;
    async fn update_stack(&self, stack_id: &str, request: StackRequest) -> anyhow::Result<()>;
    async fn delete_stack(&self, stack_id: &str) -> anyhow::Result<()>;
    async fn get_stack(&self, stack_id: &str) -> anyhow::Result<Option<Stack>>;
}

/// In-memory orchestration engine.
///
/// Stands in for the external engine in single-process dev deployments and
/// in tests. Stacks settle into their phase's complete status after a
/// configurable number of observations; tests that want to script the
/// exact sequence disable auto-settle and drive statuses by hand.
pub struct InMemoryStackEngine {
    inner: tokio::sync::Mutex<EngineInner>,
}

struct EngineInner {
    stacks: HashMap<String, EngineStack>,
    next_id: u64,
    auto_settle: bool,
    settle_after: u32,
    create_calls: u32,
    update_calls: u32,
    delete_calls: u32,
    fail_next_create: Option<String>,
    fail_next_update: Option<String>,
    default_outputs: HashMap<String, Value>,
}

struct EngineStack {
    stack: Stack,
    remaining: u32,
}

impl Default for InMemoryStackEngine {
    fn default() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(EngineInner {
                stacks: HashMap::new(),
                next_id: 0,
                auto_settle: true,
                settle_after: 2,
                create_calls: 0,
                update_calls: 0,
                delete_calls: 0,
                fail_next_create: None,
                fail_next_update: None,
                default_outputs: HashMap::new(),
            }),
        }
    }
}

impl InMemoryStackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripted mode: stacks hold their status until `set_status`.
    pub async fn set_auto_settle(&self, auto_settle: bool) {
        self.inner.lock().await.auto_settle = auto_settle;
    }

    /// Observations before an in-progress stack settles.
    pub async fn set_settle_after(&self, observations: u32) {
        self.inner.lock().await.settle_after = observations.max(1);
    }

    /// Outputs applied when a stack settles into a complete status.
    pub async fn set_default_outputs(&self, outputs: HashMap<String, Value>) {
        self.inner.lock().await.default_outputs = outputs;
    }

    pub async fn fail_next_create(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_next_create = Some(reason.into());
    }

    pub async fn fail_next_update(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_next_update = Some(reason.into());
    }

    pub async fn set_status(&self, stack_id: &str, status: StackStatus, reason: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.stacks.get_mut(stack_id) {
            entry.stack.status = status;
            entry.stack.status_reason = reason.to_string();
        }
    }

    pub async fn set_outputs(&self, stack_id: &str, outputs: HashMap<String, Value>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.stacks.get_mut(stack_id) {
            entry.stack.outputs = outputs;
        }
    }

    /// Remove a stack as if an operator deleted it out of band.
    pub async fn remove_stack(&self, stack_id: &str) {
        self.inner.lock().await.stacks.remove(stack_id);
    }

    pub async fn create_calls(&self) -> u32 {
        self.inner.lock().await.create_calls
    }

    pub async fn update_calls(&self) -> u32 {
        self.inner.lock().await.update_calls
    }

    pub async fn delete_calls(&self) -> u32 {
        self.inner.lock().await.delete_calls
    }
}

#[async_trait]
impl StackAdapter for InMemoryStackEngine {
    async fn create_stack(&self, request: StackRequest) -> anyhow::Result<String> {
        let mut inner = self.inner.lock().await;
        inner.create_calls += 1;
        if let Some(reason) = inner.fail_next_create.take() {
            anyhow::bail!("stack create rejected: {reason}");
        }

        inner.next_id += 1;
        let stack_id = format!("stack-{}-{}", inner.next_id, request.name);
        let settle_after = inner.settle_after;
        inner.stacks.insert(
            stack_id.clone(),
            EngineStack {
                stack: Stack {
                    stack_id: stack_id.clone(),
                    status: StackStatus::CreateInProgress,
                    status_reason: "Stack CREATE started".to_string(),
                    outputs: HashMap::new(),
                },
                remaining: settle_after,
            },
        );
        Ok(stack_id)
    }

    async fn update_stack(&self, stack_id: &str, _request: StackRequest) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.update_calls += 1;
        if let Some(reason) = inner.fail_next_update.take() {
            anyhow::bail!("stack update rejected: {reason}");
        }

        let settle_after = inner.settle_after;
        let entry = inner
            .stacks
            .get_mut(stack_id)
            .ok_or_else(|| anyhow::anyhow!("stack {stack_id} not found"))?;
        entry.stack.status = StackStatus::UpdateInProgress;
        entry.stack.status_reason = "Stack UPDATE started".to_string();
        entry.remaining = settle_after;
        Ok(())
    }

    async fn delete_stack(&self, stack_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.delete_calls += 1;

        // Deleting a missing stack is success per the adapter contract.
        let settle_after = inner.settle_after;
        if let Some(entry) = inner.stacks.get_mut(stack_id) {
            entry.stack.status = StackStatus::DeleteInProgress;
            entry.stack.status_reason = "Stack DELETE started".to_string();
            entry.remaining = settle_after;
        }
        Ok(())
    }

    async fn get_stack(&self, stack_id: &str) -> anyhow::Result<Option<Stack>> {
        let mut inner = self.inner.lock().await;
        let auto_settle = inner.auto_settle;
        let default_outputs = inner.default_outputs.clone();

        let mut remove = false;
        if let Some(entry) = inner.stacks.get_mut(stack_id) {
            if auto_settle {
                let settled = match entry.stack.status {
                    StackStatus::CreateInProgress
                    | StackStatus::UpdateInProgress
                    | StackStatus::DeleteInProgress
                    | StackStatus::RollbackInProgress => {
                        entry.remaining = entry.remaining.saturating_sub(1);
                        entry.remaining == 0
                    }
                    _ => false,
                };

                if settled {
                    match entry.stack.status {
                        StackStatus::CreateInProgress => {
                            entry.stack.status = StackStatus::CreateComplete;
                            entry.stack.status_reason = "Stack CREATE completed".to_string();
                            entry.stack.outputs = default_outputs;
                        }
                        StackStatus::UpdateInProgress => {
                            entry.stack.status = StackStatus::UpdateComplete;
                            entry.stack.status_reason = "Stack UPDATE completed".to_string();
                            entry.stack.outputs = default_outputs;
                        }
                        StackStatus::RollbackInProgress => {
                            entry.stack.status = StackStatus::RollbackComplete;
                            entry.stack.status_reason = "Stack ROLLBACK completed".to_string();
                        }
                        StackStatus::DeleteInProgress => {
                            remove = true;
                        }
                        _ => {}
                    }
                }
            }
        } else {
            return Ok(None);
        }

        if remove {
            inner.stacks.remove(stack_id);
            return Ok(None);
        }

        Ok(inner.stacks.get(stack_id).map(|entry| entry.stack.clone()))
    }
}
