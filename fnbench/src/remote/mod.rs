//! Collaborators outside the process: command execution, monitoring and the
//! agent server.

pub mod agent_api;
pub mod executor;
pub mod monitoring;

pub use agent_api::{ActionLocation, AgentActionClient, HttpAgentActionClient};
pub use executor::{
    CommandOutput, HttpMethod, HttpRequest, HttpResponse, ProcessExecutor, RemoteCommandExecutor,
    RemoteError,
};
pub use monitoring::{CloudMonitoringSignal, MonitoringSignal};
