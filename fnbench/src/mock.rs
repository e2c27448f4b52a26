//! Scriptable collaborators for deterministic benchmark testing.
//!
//! - [`MockExecutor`]: commands and HTTP calls answered by the first matching
//!   handler, every call recorded
//! - [`ScriptedSignal`]: per-function observation sequences
//! - [`MockAgentClient`]: in-memory agent server
//!
//! ```rust,ignore
//! let executor = MockExecutor::new().with_gcloud_defaults();
//! executor.on_command(
//!     |argv| argv.iter().any(|a| a == "deploy"),
//!     |_| Ok(CommandOutput::failed(1, "ERROR: 429 Too Many Requests")),
//! );
//! ```

use crate::remote::agent_api::{ActionLocation, AgentActionClient};
use crate::remote::executor::{
    CommandOutput, HttpRequest, HttpResponse, RemoteCommandExecutor, RemoteError,
};
use crate::remote::monitoring::MonitoringSignal;
use async_trait::async_trait;
use fnbench_common::{
    ActionKind, DeploymentTarget, InstanceObservation, ResourceSizing, Variant,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type CommandMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;
type CommandHandler = Box<dyn Fn(&[String]) -> Result<CommandOutput, RemoteError> + Send + Sync>;
type HttpMatcher = Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>;
type HttpHandler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, RemoteError> + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Test target with predictable fields.
pub fn sample_target(variant: Variant, index: usize, region: &str) -> DeploymentTarget {
    let name = DeploymentTarget::function_name("fnbench", variant, index);
    DeploymentTarget {
        display_name: format!("{name}-{region}"),
        name,
        index,
        region: region.to_string(),
        runtime: "nodejs20".to_string(),
        entry_point: "handler".to_string(),
        source_dir: PathBuf::from("/tmp/fnbench-src"),
        project: "proj".to_string(),
        variant,
        sizing: ResourceSizing::default(),
        env_vars: BTreeMap::new(),
        labels: BTreeMap::new(),
        action_count: u32::from(variant.has_agent()),
    }
}

/// Name of the function a gcloud argv refers to (`gcloud functions <verb> NAME`).
pub fn function_name_of(argv: &[String]) -> Option<&str> {
    match argv {
        [_, group, _, name, ..] if group == "functions" => Some(name.as_str()),
        _ => None,
    }
}

pub fn has_arg(argv: &[String], needle: &str) -> bool {
    argv.iter().any(|a| a == needle)
}

/// Scripted [`RemoteCommandExecutor`].
///
/// Unmatched commands succeed with empty output; unmatched HTTP calls return
/// `200 {}`.
#[derive(Default)]
pub struct MockExecutor {
    commands: Mutex<Vec<(CommandMatcher, CommandHandler)>>,
    http: Mutex<Vec<(HttpMatcher, HttpHandler)>>,
    command_log: Mutex<Vec<Vec<String>>>,
    http_log: Mutex<Vec<HttpRequest>>,
    command_latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer deploy, describe and delete the way a healthy backend would.
    ///
    /// Handlers added later with [`on_command`](Self::on_command) take
    /// precedence because they are checked first.
    pub fn with_gcloud_defaults(self) -> Self {
        self.push_command(
            |argv| has_arg(argv, "describe") && argv.iter().any(|a| a.contains("serviceConfig.uri")),
            |argv| {
                let name = function_name_of(argv).unwrap_or("unknown");
                Ok(CommandOutput::ok(format!("https://{name}.run.app\n")))
            },
        );
        self.push_command(
            |argv| has_arg(argv, "describe") && has_arg(argv, "--format=json"),
            |argv| {
                let name = function_name_of(argv).unwrap_or("unknown");
                Ok(CommandOutput::ok(
                    serde_json::json!({
                        "name": name,
                        "buildConfig": {
                            "source": {"storageSource": {"bucket": "gcf-sources", "object": format!("{name}.zip")}},
                            "imageUri": format!("europe-docker.pkg.dev/proj/gcf-artifacts/{name}:latest"),
                        }
                    })
                    .to_string(),
                ))
            },
        );
        self
    }

    fn push_command<M, H>(&self, matcher: M, handler: H)
    where
        M: Fn(&[String]) -> bool + Send + Sync + 'static,
        H: Fn(&[String]) -> Result<CommandOutput, RemoteError> + Send + Sync + 'static,
    {
        lock(&self.commands).push((Box::new(matcher), Box::new(handler)));
    }

    /// Register a command handler ahead of all existing ones.
    pub fn on_command<M, H>(&self, matcher: M, handler: H)
    where
        M: Fn(&[String]) -> bool + Send + Sync + 'static,
        H: Fn(&[String]) -> Result<CommandOutput, RemoteError> + Send + Sync + 'static,
    {
        lock(&self.commands).insert(0, (Box::new(matcher), Box::new(handler)));
    }

    /// Register an HTTP handler ahead of all existing ones.
    pub fn on_http<M, H>(&self, matcher: M, handler: H)
    where
        M: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
        H: Fn(&HttpRequest) -> Result<HttpResponse, RemoteError> + Send + Sync + 'static,
    {
        lock(&self.http).insert(0, (Box::new(matcher), Box::new(handler)));
    }

    /// Simulated time every command takes.
    pub fn set_command_latency(&self, latency: Duration) {
        *lock(&self.command_latency) = latency;
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.command_log).clone()
    }

    /// Recorded commands whose argv contains `verb`.
    pub fn commands_with(&self, verb: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|argv| has_arg(argv, verb))
            .collect()
    }

    /// Names of functions a `gcloud functions delete` was issued for.
    pub fn deleted_functions(&self) -> Vec<String> {
        self.commands_with("delete")
            .iter()
            .filter_map(|argv| function_name_of(argv).map(str::to_string))
            .collect()
    }

    pub fn http_calls(&self) -> Vec<HttpRequest> {
        lock(&self.http_log).clone()
    }

    /// Highest number of commands observed running at the same time.
    pub fn max_concurrent_commands(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteCommandExecutor for MockExecutor {
    async fn run(&self, argv: &[String], _timeout: Duration) -> Result<CommandOutput, RemoteError> {
        lock(&self.command_log).push(argv.to_vec());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *lock(&self.command_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let commands = lock(&self.commands);
            commands
                .iter()
                .find(|(matcher, _)| matcher(argv))
                .map(|(_, handler)| handler(argv))
                .unwrap_or_else(|| Ok(CommandOutput::ok("")))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_http(
        &self,
        request: HttpRequest,
        _timeout: Duration,
    ) -> Result<HttpResponse, RemoteError> {
        lock(&self.http_log).push(request.clone());
        let handlers = lock(&self.http);
        handlers
            .iter()
            .find(|(matcher, _)| matcher(&request))
            .map(|(_, handler)| handler(&request))
            .unwrap_or_else(|| {
                Ok(HttpResponse {
                    status: 200,
                    body: "{}".to_string(),
                })
            })
    }
}

/// [`MonitoringSignal`] replaying scripted observations per function.
///
/// Once a function's script is exhausted the default observation repeats.
pub struct ScriptedSignal {
    default: InstanceObservation,
    scripts: Mutex<HashMap<String, VecDeque<InstanceObservation>>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSignal {
    pub fn always(observation: InstanceObservation) -> Self {
        Self {
            default: observation,
            scripts: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(
        self,
        function: &str,
        observations: impl IntoIterator<Item = InstanceObservation>,
    ) -> Self {
        lock(&self.scripts).insert(function.to_string(), observations.into_iter().collect());
        self
    }

    pub fn query_count(&self, function: &str) -> usize {
        lock(&self.queries).iter().filter(|f| *f == function).count()
    }

    pub fn total_queries(&self) -> usize {
        lock(&self.queries).len()
    }
}

/// Warm reading with `count` instances.
pub fn warm(count: u64) -> InstanceObservation {
    InstanceObservation::Observed {
        count,
        state: "active".to_string(),
    }
}

#[async_trait]
impl MonitoringSignal for ScriptedSignal {
    async fn query_instance_count(
        &self,
        target: &DeploymentTarget,
        _lookback: Duration,
    ) -> InstanceObservation {
        lock(&self.queries).push(target.name.clone());
        lock(&self.scripts)
            .get_mut(&target.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

/// In-memory [`AgentActionClient`].
#[derive(Default)]
pub struct MockAgentClient {
    /// Lookups that return `None` before the agent "registers".
    misses_before_found: AtomicUsize,
    lookups: AtomicUsize,
    never_found: bool,
    fail_add: bool,
    /// Bound-action queries answered with nothing before the agent binds.
    polls_before_bound: AtomicUsize,
    bind_polls: AtomicUsize,
    never_binds: bool,
    next_action: AtomicUsize,
    added: Mutex<Vec<(ActionKind, ActionLocation, u32)>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MockAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn found_after(misses: usize) -> Self {
        let client = Self::default();
        client.misses_before_found.store(misses, Ordering::SeqCst);
        client
    }

    pub fn never_found() -> Self {
        Self {
            never_found: true,
            ..Self::default()
        }
    }

    pub fn failing_add() -> Self {
        Self {
            fail_add: true,
            ..Self::default()
        }
    }

    pub fn bound_after(polls: usize) -> Self {
        let client = Self::default();
        client.polls_before_bound.store(polls, Ordering::SeqCst);
        client
    }

    pub fn never_binds() -> Self {
        Self {
            never_binds: true,
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn bind_polls(&self) -> usize {
        self.bind_polls.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> Vec<(ActionKind, ActionLocation, u32)> {
        lock(&self.added).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl AgentActionClient for MockAgentClient {
    async fn get_agent_id(&self, display_name: &str) -> Option<String> {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.never_found || n < self.misses_before_found.load(Ordering::SeqCst) {
            return None;
        }
        Some(format!("agent-{display_name}"))
    }

    async fn add_action(
        &self,
        kind: ActionKind,
        location: &ActionLocation,
        max_hits: u32,
    ) -> Option<String> {
        if self.fail_add {
            return None;
        }
        lock(&self.added).push((kind, location.clone(), max_hits));
        let n = self.next_action.fetch_add(1, Ordering::SeqCst);
        let id = format!("action-{n}");
        lock(&self.created).push(id.clone());
        Some(id)
    }

    async fn get_action(&self, _kind: ActionKind, _action_id: &str) -> Option<u64> {
        Some(0)
    }

    async fn delete_action(&self, _kind: ActionKind, action_id: &str) -> bool {
        lock(&self.deleted).push(action_id.to_string());
        true
    }

    async fn get_bound_actions(&self, _agent_id: &str) -> Option<Vec<String>> {
        let n = self.bind_polls.fetch_add(1, Ordering::SeqCst);
        if self.never_binds || n < self.polls_before_bound.load(Ordering::SeqCst) {
            return Some(Vec::new());
        }
        let deleted = lock(&self.deleted).clone();
        Some(
            lock(&self.created)
                .iter()
                .filter(|id| !deleted.contains(id))
                .cloned()
                .collect(),
        )
    }
}
