//! Client for the debugging agent server's action API.

use crate::remote::executor::{HttpRequest, HttpResponse, RemoteCommandExecutor, RemoteError};
use async_trait::async_trait;
use fnbench_common::ActionKind;
use fnbench_common::config::AgentConfig;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an attached action stays alive on the server.
const ACTION_EXPIRY_SECS: u64 = 3600;

/// Where an action is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLocation {
    pub agent_id: String,
    pub file: String,
    pub line: u32,
}

/// Agent lookup and action management. Every failure is reported as `None`
/// or `false`; callers decide whether that is fatal.
#[async_trait]
pub trait AgentActionClient: Send + Sync {
    /// Id of the first registered agent whose display name contains `display_name`.
    async fn get_agent_id(&self, display_name: &str) -> Option<String>;

    async fn add_action(
        &self,
        kind: ActionKind,
        location: &ActionLocation,
        max_hits: u32,
    ) -> Option<String>;

    /// Current hit count of an action.
    async fn get_action(&self, kind: ActionKind, action_id: &str) -> Option<u64>;

    async fn delete_action(&self, kind: ActionKind, action_id: &str) -> bool;

    /// Ids of the actions the agent has picked up so far.
    async fn get_bound_actions(&self, agent_id: &str) -> Option<Vec<String>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentRecord {
    id: Option<String>,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRecord {
    id: Option<String>,
    #[serde(default)]
    hit_count: Option<u64>,
}

/// REST client authenticated with a bearer API key.
pub struct HttpAgentActionClient {
    executor: Arc<dyn RemoteCommandExecutor>,
    base_url: String,
    company_id: String,
    api_key: String,
    timeout: Duration,
}

impl HttpAgentActionClient {
    pub fn new(
        executor: Arc<dyn RemoteCommandExecutor>,
        server_host: &str,
        company_id: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let host = server_host.trim_end_matches('/');
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Self {
            executor,
            base_url,
            company_id: company_id.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Build from the agent section of the run configuration.
    pub fn from_config(executor: Arc<dyn RemoteCommandExecutor>, config: &AgentConfig) -> Self {
        Self::new(
            executor,
            &config.server_host,
            config.company_id.clone().unwrap_or_default(),
            config.api_key.clone().unwrap_or_default(),
            config.api_timeout,
        )
    }

    fn company_url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/companies/{}/{}",
            self.base_url, self.company_id, path
        )
    }

    fn action_path(kind: ActionKind) -> &'static str {
        match kind {
            ActionKind::Snapshot => "actions/snapshots",
            ActionKind::Log => "actions/logs",
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RemoteError> {
        self.executor
            .run_http(request.bearer(&self.api_key), self.timeout)
            .await
    }
}

#[async_trait]
impl AgentActionClient for HttpAgentActionClient {
    async fn get_agent_id(&self, display_name: &str) -> Option<String> {
        let response = match self.send(HttpRequest::get(self.company_url("agents"))).await {
            Ok(r) if r.status == 200 => r,
            Ok(r) => {
                warn!(status = r.status, body = %r.body, "Failed to list agents");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to list agents");
                return None;
            }
        };

        let agents: Vec<AgentRecord> = match response.json() {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Malformed agent list");
                return None;
            }
        };
        let found = agents
            .into_iter()
            .find(|a| a.display_name.contains(display_name))
            .and_then(|a| a.id);
        debug!(display_name, agent_id = ?found, "Agent lookup");
        found
    }

    async fn add_action(
        &self,
        kind: ActionKind,
        location: &ActionLocation,
        max_hits: u32,
    ) -> Option<String> {
        let mut body = json!({
            "agentId": location.agent_id,
            "filename": location.file,
            "lineNumber": location.line,
            "maxHitCount": max_hits,
            "expireSec": ACTION_EXPIRY_SECS,
        });
        if kind == ActionKind::Log {
            body["logMessage"] = json!("fnbench log action hit");
        }

        let request = HttpRequest::post(self.company_url(Self::action_path(kind))).json(body);
        match self.send(request).await {
            Ok(r) if r.status == 200 || r.status == 201 => {
                let id = r.json::<ActionRecord>().ok().and_then(|a| a.id);
                info!(
                    %kind,
                    action_id = ?id,
                    file = %location.file,
                    line = location.line,
                    max_hits,
                    "Action created"
                );
                id
            }
            Ok(r) => {
                warn!(%kind, status = r.status, body = %r.body, "Failed to create action");
                None
            }
            Err(e) => {
                warn!(%kind, error = %e, "Failed to create action");
                None
            }
        }
    }

    async fn get_action(&self, kind: ActionKind, action_id: &str) -> Option<u64> {
        let url = self.company_url(&format!("{}/{action_id}", Self::action_path(kind)));
        match self.send(HttpRequest::get(url)).await {
            Ok(r) if r.status == 200 => r.json::<ActionRecord>().ok()?.hit_count,
            Ok(r) => {
                debug!(%kind, action_id, status = r.status, "Action lookup failed");
                None
            }
            Err(e) => {
                debug!(%kind, action_id, error = %e, "Action lookup failed");
                None
            }
        }
    }

    async fn delete_action(&self, kind: ActionKind, action_id: &str) -> bool {
        let url = self.company_url(&format!("{}/{action_id}", Self::action_path(kind)));
        match self.send(HttpRequest::delete(url)).await {
            Ok(r) if r.status == 200 || r.status == 204 => {
                info!(%kind, action_id, "Action deleted");
                true
            }
            Ok(r) => {
                warn!(%kind, action_id, status = r.status, body = %r.body, "Failed to delete action");
                false
            }
            Err(e) => {
                warn!(%kind, action_id, error = %e, "Failed to delete action");
                false
            }
        }
    }

    async fn get_bound_actions(&self, agent_id: &str) -> Option<Vec<String>> {
        let url = self.company_url(&format!("agents/{agent_id}/actions"));
        let response = match self.send(HttpRequest::get(url)).await {
            Ok(r) if r.status == 200 => r,
            Ok(r) => {
                debug!(agent_id, status = r.status, "Bound action lookup failed");
                return None;
            }
            Err(e) => {
                debug!(agent_id, error = %e, "Bound action lookup failed");
                return None;
            }
        };
        let actions: Vec<ActionRecord> = response.json().ok()?;
        Some(actions.into_iter().filter_map(|a| a.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExecutor;
    use crate::remote::executor::HttpMethod;

    fn client(executor: Arc<MockExecutor>) -> HttpAgentActionClient {
        HttpAgentActionClient::new(
            executor,
            "agents.example.test",
            "acme",
            "key-1",
            Duration::from_secs(5),
        )
    }

    fn ok(status: u16, body: &str) -> Result<HttpResponse, RemoteError> {
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }

    #[tokio::test]
    async fn test_get_agent_id_matches_substring() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(
            |req| req.url.ends_with("/agents"),
            |_| {
                ok(
                    200,
                    r#"[{"id":"a-1","displayName":"other"},{"id":"a-2","displayName":"fnbench-agent-003-europe"}]"#,
                )
            },
        );
        let client = client(executor.clone());
        assert_eq!(
            client.get_agent_id("fnbench-agent-003").await.as_deref(),
            Some("a-2")
        );
        let calls = executor.http_calls();
        assert_eq!(
            calls[0].url,
            "https://agents.example.test/api/v1/companies/acme/agents"
        );
        assert!(
            calls[0]
                .headers
                .contains(&("Authorization".to_string(), "Bearer key-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_get_agent_id_not_found() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(|_| true, |_| ok(200, "[]"));
        assert!(client(executor).get_agent_id("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_get_agent_id_server_error() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(|_| true, |_| ok(503, "down"));
        assert!(client(executor).get_agent_id("x").await.is_none());
    }

    #[tokio::test]
    async fn test_add_snapshot_body() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(
            |req| req.method == HttpMethod::Post,
            |_| ok(201, r#"{"id":"snap-9"}"#),
        );
        let location = ActionLocation {
            agent_id: "a-2".into(),
            file: "index.js".into(),
            line: 12,
        };
        let id = client(executor.clone())
            .add_action(ActionKind::Snapshot, &location, 50)
            .await;
        assert_eq!(id.as_deref(), Some("snap-9"));

        let calls = executor.http_calls();
        assert!(calls[0].url.ends_with("/actions/snapshots"));
        let body = calls[0].body.clone().unwrap();
        assert_eq!(body["agentId"], "a-2");
        assert_eq!(body["lineNumber"], 12);
        assert_eq!(body["maxHitCount"], 50);
        assert!(body.get("logMessage").is_none());
    }

    #[tokio::test]
    async fn test_add_log_action_has_message() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(|_| true, |_| ok(200, r#"{"id":"log-1"}"#));
        let location = ActionLocation {
            agent_id: "a".into(),
            file: "index.js".into(),
            line: 1,
        };
        let id = client(executor.clone())
            .add_action(ActionKind::Log, &location, 5)
            .await;
        assert_eq!(id.as_deref(), Some("log-1"));
        let calls = executor.http_calls();
        assert!(calls[0].url.ends_with("/actions/logs"));
        assert!(calls[0].body.as_ref().unwrap().get("logMessage").is_some());
    }

    #[tokio::test]
    async fn test_get_and_delete_action() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(
            |req| req.method == HttpMethod::Get,
            |_| ok(200, r#"{"id":"snap-9","hitCount":4}"#),
        );
        executor.on_http(|req| req.method == HttpMethod::Delete, |_| ok(204, ""));
        let client = client(executor.clone());
        assert_eq!(client.get_action(ActionKind::Snapshot, "snap-9").await, Some(4));
        assert!(client.delete_action(ActionKind::Snapshot, "snap-9").await);
        assert!(executor.http_calls()[1].url.ends_with("/actions/snapshots/snap-9"));
    }

    #[tokio::test]
    async fn test_get_bound_actions() {
        let executor = Arc::new(MockExecutor::new());
        executor.on_http(
            |req| req.url.ends_with("/agents/a-2/actions"),
            |_| ok(200, r#"[{"id":"snap-1"},{"id":"log-4"},{"hitCount":0}]"#),
        );
        executor.on_http(|req| req.url.contains("/agents/a-3/"), |_| ok(404, "no agent"));
        let client = client(executor.clone());

        assert_eq!(
            client.get_bound_actions("a-2").await,
            Some(vec!["snap-1".to_string(), "log-4".to_string()])
        );
        assert_eq!(client.get_bound_actions("a-3").await, None);
        assert_eq!(
            executor.http_calls()[0].url,
            "https://agents.example.test/api/v1/companies/acme/agents/a-2/actions"
        );
    }

    #[test]
    fn test_base_url_keeps_explicit_scheme() {
        let executor = Arc::new(MockExecutor::new());
        let client = HttpAgentActionClient::new(
            executor,
            "http://localhost:8080/",
            "c",
            "k",
            Duration::from_secs(1),
        );
        assert_eq!(
            client.company_url("agents"),
            "http://localhost:8080/api/v1/companies/c/agents"
        );
    }
}
