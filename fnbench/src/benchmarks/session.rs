//! Debugging session against one function's agent.
//!
//! A session finds the agent that registered under the function's display
//! name, attaches the case's actions, waits for the agent to bind them and
//! removes every action it attached when the case is done.

use crate::benchmarks::context::{CancelFlag, cancellable_sleep};
use crate::benchmarks::error::BenchmarkError;
use crate::remote::{ActionLocation, AgentActionClient};
use fnbench_common::ActionKind;
use fnbench_common::config::AgentConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct DebuggingSession {
    client: Arc<dyn AgentActionClient>,
    config: AgentConfig,
    display_name: String,
    agent_id: Option<String>,
    applied: Vec<(ActionKind, String)>,
}

impl DebuggingSession {
    pub fn new(client: Arc<dyn AgentActionClient>, config: AgentConfig, display_name: &str) -> Self {
        Self {
            client,
            config,
            display_name: display_name.to_string(),
            agent_id: None,
            applied: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn applied_actions(&self) -> &[(ActionKind, String)] {
        &self.applied
    }

    /// Look up the agent, polling until it registers.
    pub async fn find_agent(&mut self, cancel: &CancelFlag) -> Result<String, BenchmarkError> {
        if let Some(id) = &self.agent_id {
            return Ok(id.clone());
        }

        let attempts = self.config.lookup_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(id) = self.client.get_agent_id(&self.display_name).await {
                if attempt > 0 {
                    info!(display_name = %self.display_name, retries = attempt, "Agent found");
                }
                self.agent_id = Some(id.clone());
                return Ok(id);
            }
            debug!(
                display_name = %self.display_name,
                attempt = attempt + 1,
                attempts,
                "Agent not registered yet"
            );
            if attempt + 1 < attempts
                && !cancellable_sleep(self.config.lookup_interval, cancel).await
            {
                return Err(BenchmarkError::Cancelled);
            }
        }

        Err(BenchmarkError::AgentNotFound {
            display_name: self.display_name.clone(),
            attempts,
        })
    }

    /// Attach `count` actions on consecutive configured lines. Actions
    /// attached before a failure stay tracked for [`Self::remove_all`].
    pub async fn apply_actions(
        &mut self,
        count: u32,
        cancel: &CancelFlag,
    ) -> Result<usize, BenchmarkError> {
        if count == 0 {
            return Ok(0);
        }
        let agent_id = self.find_agent(cancel).await?;
        let kind = self.config.action_kind;
        for n in 0..count {
            if cancel.is_cancelled() {
                return Err(BenchmarkError::Cancelled);
            }
            let location = ActionLocation {
                agent_id: agent_id.clone(),
                file: self.config.action_file.clone(),
                line: self.config.action_line_for(n),
            };
            let Some(action_id) = self
                .client
                .add_action(kind, &location, self.config.action_max_hits)
                .await
            else {
                return Err(BenchmarkError::ActionAttachFailed(format!(
                    "{kind} at {}:{} for '{}'",
                    location.file, location.line, self.display_name
                )));
            };
            debug!(
                display_name = %self.display_name,
                kind = %kind,
                action_id = %action_id,
                line = location.line,
                "Action attached"
            );
            self.applied.push((kind, action_id));
        }
        info!(display_name = %self.display_name, kind = %kind, count, "Actions attached");
        Ok(self.applied.len())
    }

    /// Poll the agent until it reports every attached action as bound.
    ///
    /// `wake` runs between polls; the agent only refreshes its action list
    /// while the function handles requests. Gives up after the configured
    /// bind timeout.
    pub async fn wait_for_bind<F, Fut>(
        &self,
        cancel: &CancelFlag,
        mut wake: F,
    ) -> Result<Duration, BenchmarkError>
    where
        F: FnMut() -> Fut,
        Fut: Future,
    {
        let Some(agent_id) = self.agent_id.as_deref() else {
            return Ok(Duration::ZERO);
        };
        if self.applied.is_empty() {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let expected = self.applied.len();
        loop {
            let bound = self
                .client
                .get_bound_actions(agent_id)
                .await
                .unwrap_or_default();
            let pending = self
                .applied
                .iter()
                .filter(|(_, id)| !bound.contains(id))
                .count();
            let waited = started.elapsed();
            if pending == 0 {
                info!(
                    display_name = %self.display_name,
                    actions = expected,
                    waited_secs = waited.as_secs(),
                    "Actions bound"
                );
                return Ok(waited);
            }
            if waited >= self.config.bind_timeout {
                return Err(BenchmarkError::ActionsNotBound {
                    pending,
                    expected,
                    waited,
                });
            }
            debug!(display_name = %self.display_name, pending, expected, "Waiting for agent to bind actions");
            if !cancellable_sleep(self.config.bind_poll_interval, cancel).await {
                return Err(BenchmarkError::Cancelled);
            }
            wake().await;
        }
    }

    /// Total hits across attached actions, if every one could be read.
    pub async fn hit_count(&self) -> Option<u64> {
        let mut total: u64 = 0;
        for (kind, id) in &self.applied {
            total += self.client.get_action(*kind, id).await?;
        }
        Some(total)
    }

    /// Remove every attached action. Actions that fail to delete stay
    /// tracked; returns how many failed.
    pub async fn remove_all(&mut self) -> usize {
        let mut remaining = Vec::new();
        for (kind, id) in self.applied.drain(..) {
            if !self.client.delete_action(kind, &id).await {
                warn!(display_name = %self.display_name, action_id = %id, "Failed to remove action");
                remaining.push((kind, id));
            }
        }
        let failed = remaining.len();
        self.applied = remaining;
        failed
    }
}
