use std::path::PathBuf;

use dap::events::Event;
use dap::requests::Request;
use dap::responses::Response;
use serde::Deserialize;
use url::Url;

use crate::channel::{ChannelCommand, ChannelEvent};
use crate::launch::LaunchPlan;

/// Everything the dispatcher reacts to, in arrival order.
#[derive(Debug)]
pub enum SessionInput {
    /// A request from the IDE
    Request(Request),
    /// An event from the debug server connection
    Channel(ChannelEvent),
    /// Output or lifecycle news from the spawned runtime
    Process(ProcessEvent),
    /// The IDE closed its stream
    ClientClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// The runtime closed its standard output.
    StdoutClosed,
    SpawnFailed(String),
}

/// Side effects requested by the session, executed by the dispatcher in order.
#[derive(Debug)]
pub enum Action {
    Respond(Response),
    Emit(Event),
    Channel(ChannelCommand),
    Connect(Url),
    Spawn(LaunchPlan),
    KillProcess,
    CloseChannel,
    Shutdown,
}

/// Launch arguments for DAP launch configuration
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArgs {
    pub script: PathBuf,
    #[serde(rename = "ballerina.home", alias = "runtimeHome", default)]
    pub runtime_home: Option<PathBuf>,
}

/// Attach arguments for DAP attach configuration
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AttachArgs {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
