use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use foreman::domain::ports::{ToolContext, ToolError, ToolHandler, ToolOutput};

/// Succeeds after `delay`, counting invocations per task.
#[derive(Default)]
pub struct CountingTool {
    delay: Duration,
    invocations: Mutex<HashMap<Uuid, usize>>,
}

impl CountingTool {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            invocations: Mutex::default(),
        }
    }

    pub fn invocations(&self) -> HashMap<Uuid, usize> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.invocations.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ToolHandler for CountingTool {
    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        *self.invocations.lock().unwrap().entry(ctx.task_id).or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ToolOutput::new(json!({ "task_id": ctx.task_id, "input": ctx.input })))
    }
}

/// Plays back queued outcomes, then succeeds.
#[derive(Default)]
pub struct ScriptedTool {
    outcomes: Mutex<VecDeque<Result<serde_json::Value, ToolError>>>,
    calls: Mutex<usize>,
}

impl ScriptedTool {
    pub fn new(outcomes: impl IntoIterator<Item = Result<serde_json::Value, ToolError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ToolHandler for ScriptedTool {
    async fn invoke(&self, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        *self.calls.lock().unwrap() += 1;
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(Ok(value)) => Ok(ToolOutput::new(value)),
            Some(Err(e)) => Err(e),
            None => Ok(ToolOutput::new(json!("ok"))),
        }
    }
}

/// Runs until its cancellation token fires.
pub struct UntilCancelled;

#[async_trait]
impl ToolHandler for UntilCancelled {
    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        ctx.cancellation.cancelled().await;
        Err(ToolError::Cancelled)
    }
}
