//! Client for the runtime's remote debugger.
//!
//! The debugger listens on `ws://<host>:<port>/debug` and exchanges JSON text
//! frames. Outbound messages carry a `command`, inbound ones a `code`.

use crossbeam_channel::Sender;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::breakpoints::DEFAULT_PACKAGE;
use crate::error::BalAdapterError;
use crate::mapping::ScopeKind;
use crate::protocol::SessionInput;

/// Builds the debugger endpoint for `host:port`.
pub fn debug_url(host: &str, port: u16) -> Result<Url, BalAdapterError> {
    Url::parse(&format!("ws://{}:{}/debug", host, port))
        .map_err(|e| BalAdapterError::ProtocolError(format!("Invalid debug server address: {}", e)))
}

/// Commands the session issues to the debug server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    AddBreakpoint {
        line: i64,
        file: String,
        package: String,
    },
    /// Clears the points of one file within one unit.
    RemoveBreakpoints {
        file: String,
        package: String,
    },
    Start,
    Resume(String),
    StepOver(String),
    StepIn(String),
    StepOut(String),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugPoint {
    pub file_name: String,
    pub line_number: i64,
    pub package_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireCommand {
    SetPoints {
        points: Vec<DebugPoint>,
    },
    Start,
    #[serde(rename_all = "camelCase")]
    Resume {
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StepOver {
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StepIn {
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StepOut {
        thread_id: String,
    },
    Stop,
}

/// The debugger only accepts the complete point list, so add/remove are folded
/// into the list kept here and sent whole.
#[derive(Debug, Default)]
pub struct PointSet {
    points: Vec<DebugPoint>,
}

impl PointSet {
    pub fn encode(&mut self, command: ChannelCommand) -> WireCommand {
        match command {
            ChannelCommand::AddBreakpoint {
                line,
                file,
                package,
            } => {
                self.points.push(DebugPoint {
                    file_name: file,
                    line_number: line,
                    package_path: package,
                });
                self.set_points()
            }
            ChannelCommand::RemoveBreakpoints { file, package } => {
                self.points
                    .retain(|point| point.file_name != file || point.package_path != package);
                self.set_points()
            }
            ChannelCommand::Start => WireCommand::Start,
            ChannelCommand::Resume(thread_id) => WireCommand::Resume { thread_id },
            ChannelCommand::StepOver(thread_id) => WireCommand::StepOver { thread_id },
            ChannelCommand::StepIn(thread_id) => WireCommand::StepIn { thread_id },
            ChannelCommand::StepOut(thread_id) => WireCommand::StepOut { thread_id },
            ChannelCommand::Terminate => WireCommand::Stop,
        }
    }

    fn set_points(&self) -> WireCommand {
        WireCommand::SetPoints {
            points: self.points.clone(),
        }
    }
}

/// Payload of a `DEBUG_HIT` message: where a thread stopped and its full stack.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugHit {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub frames: Vec<Frame>,
}

impl DebugHit {
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref().or(self.worker_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default = "default_package")]
    pub package_path: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            file_name: String::new(),
            line_number: 0,
            package_path: default_package(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub frame_name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(rename = "lineID", default)]
    pub line_id: i64,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default, deserialize_with = "value_as_text")]
    pub value: String,
    pub scope: ScopeKind,
}

fn default_package() -> String {
    DEFAULT_PACKAGE.to_string()
}

fn value_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
enum WireEvent {
    DebugHit(DebugHit),
    Exit,
    Complete,
    #[serde(other)]
    Other,
}

/// Events the debug server delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    BreakpointHit(Box<DebugHit>),
    ExecutionEnded,
    ConnectionError(String),
}

/// Decodes one inbound text frame. Messages the adapter has no use for yield `None`.
pub fn decode_event(text: &str) -> Option<ChannelEvent> {
    match serde_json::from_str::<WireEvent>(text) {
        Ok(WireEvent::DebugHit(hit)) => Some(ChannelEvent::BreakpointHit(Box::new(hit))),
        Ok(WireEvent::Exit) | Ok(WireEvent::Complete) => Some(ChannelEvent::ExecutionEnded),
        Ok(WireEvent::Other) => {
            debug!(message = %text, "Ignoring debug server message");
            None
        }
        Err(e) => Some(ChannelEvent::ConnectionError(format!(
            "Malformed debug server message: {}",
            e
        ))),
    }
}

#[derive(Debug)]
enum ClientOp {
    Connect(Url),
    Send(ChannelCommand),
    Close,
}

/// Handle to the connection task.
///
/// Commands sent before [`EventChannelClient::connect`] are queued and flushed in
/// order once the socket opens. Every event is delivered to the session input queue.
#[derive(Debug, Clone)]
pub struct EventChannelClient {
    ops: UnboundedSender<ClientOp>,
}

impl EventChannelClient {
    pub fn spawn(runtime: &tokio::runtime::Handle, events: Sender<SessionInput>) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_connection(ops_rx, events));
        Self { ops: ops_tx }
    }

    pub fn connect(&self, url: Url) {
        self.submit(ClientOp::Connect(url));
    }

    pub fn send(&self, command: ChannelCommand) {
        self.submit(ClientOp::Send(command));
    }

    pub fn close(&self) {
        self.submit(ClientOp::Close);
    }

    fn submit(&self, op: ClientOp) {
        if let Err(e) = self.ops.send(op) {
            debug!(op = ?e.0, "Debug server connection already closed");
        }
    }
}

fn emit(events: &Sender<SessionInput>, event: ChannelEvent) {
    if events.send(SessionInput::Channel(event)).is_err() {
        debug!("Session input closed, dropping debug server event");
    }
}

async fn run_connection(mut ops: UnboundedReceiver<ClientOp>, events: Sender<SessionInput>) {
    let mut points = PointSet::default();
    let mut queued = Vec::new();

    // A failed connect leaves the queue intact for the next attempt.
    let socket = loop {
        let url = loop {
            match ops.recv().await {
                Some(ClientOp::Connect(url)) => break url,
                Some(ClientOp::Send(command)) => queued.push(points.encode(command)),
                Some(ClientOp::Close) | None => return,
            }
        };

        info!(url = %url, "Connecting to debug server");
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => break socket,
            Err(e) => {
                error!(error = %e, "Failed to connect to debug server");
                emit(&events, ChannelEvent::ConnectionError(e.to_string()));
            }
        }
    };
    emit(&events, ChannelEvent::Opened);

    let (mut sink, mut stream) = socket.split();

    for command in queued {
        if let Err(e) = send_command(&mut sink, &command).await {
            emit(&events, ChannelEvent::ConnectionError(e.to_string()));
        }
    }

    loop {
        tokio::select! {
            op = ops.recv() => match op {
                Some(ClientOp::Send(command)) => {
                    let wire = points.encode(command);
                    if let Err(e) = send_command(&mut sink, &wire).await {
                        error!(error = %e, "Failed to send command to debug server");
                        emit(&events, ChannelEvent::ConnectionError(e.to_string()));
                    }
                }
                Some(ClientOp::Connect(url)) => {
                    warn!(url = %url, "Already connected to debug server, ignoring connect");
                }
                Some(ClientOp::Close) | None => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "Failed to close debug server connection");
                    }
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_event(&text) {
                        emit(&events, event);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Debug server closed the connection");
                    emit(&events, ChannelEvent::ConnectionError("connection closed".to_string()));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Debug server connection failed");
                    emit(&events, ChannelEvent::ConnectionError(e.to_string()));
                    break;
                }
            },
        }
    }
}

async fn send_command<S>(sink: &mut S, command: &WireCommand) -> Result<(), BalAdapterError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let payload = serde_json::to_string(command)
        .map_err(|e| BalAdapterError::Connection(format!("Failed to encode command: {}", e)))?;
    debug!(payload = %payload, "Sending command to debug server");
    sink.send(Message::Text(payload.into()))
        .await
        .map_err(|e| BalAdapterError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_point_set_replaces_points_of_file() {
        let mut points = PointSet::default();
        points.encode(ChannelCommand::AddBreakpoint {
            line: 3,
            file: "a.bal".to_string(),
            package: ".".to_string(),
        });
        points.encode(ChannelCommand::AddBreakpoint {
            line: 5,
            file: "b.bal".to_string(),
            package: ".".to_string(),
        });

        let wire = points.encode(ChannelCommand::RemoveBreakpoints {
            file: "a.bal".to_string(),
            package: ".".to_string(),
        });

        assert_eq!(
            wire,
            WireCommand::SetPoints {
                points: vec![DebugPoint {
                    file_name: "b.bal".to_string(),
                    line_number: 5,
                    package_path: ".".to_string(),
                }]
            }
        );
    }

    #[test]
    fn test_point_set_keeps_same_name_in_other_package() {
        let mut points = PointSet::default();
        for (line, package) in [(3, "a"), (5, "b")] {
            points.encode(ChannelCommand::AddBreakpoint {
                line,
                file: "util.bal".to_string(),
                package: package.to_string(),
            });
        }

        let wire = points.encode(ChannelCommand::RemoveBreakpoints {
            file: "util.bal".to_string(),
            package: "b".to_string(),
        });

        assert_eq!(
            wire,
            WireCommand::SetPoints {
                points: vec![DebugPoint {
                    file_name: "util.bal".to_string(),
                    line_number: 3,
                    package_path: "a".to_string(),
                }]
            }
        );
    }

    #[test]
    fn test_wire_command_json() {
        let mut points = PointSet::default();
        let add = points.encode(ChannelCommand::AddBreakpoint {
            line: 7,
            file: "svc.bal".to_string(),
            package: "a.b".to_string(),
        });

        assert_eq!(
            serde_json::to_value(&add).unwrap(),
            json!({
                "command": "SET_POINTS",
                "points": [{"fileName": "svc.bal", "lineNumber": 7, "packagePath": "a.b"}]
            })
        );
        assert_eq!(
            serde_json::to_value(points.encode(ChannelCommand::StepOver("main-1".to_string())))
                .unwrap(),
            json!({"command": "STEP_OVER", "threadId": "main-1"})
        );
        assert_eq!(
            serde_json::to_value(points.encode(ChannelCommand::Start)).unwrap(),
            json!({"command": "START"})
        );
        assert_eq!(
            serde_json::to_value(points.encode(ChannelCommand::Terminate)).unwrap(),
            json!({"command": "STOP"})
        );
    }

    #[test]
    fn test_decode_debug_hit() {
        let text = json!({
            "code": "DEBUG_HIT",
            "workerId": "w1-x",
            "location": {"fileName": "a.bal", "lineNumber": 5, "packagePath": "."},
            "frames": [{
                "frameName": "main",
                "fileName": "a.bal",
                "lineID": 5,
                "variables": [
                    {"name": "x", "value": "1", "scope": "Local"},
                    {"name": "count", "value": 42, "scope": "Global"}
                ]
            }]
        })
        .to_string();

        let Some(ChannelEvent::BreakpointHit(hit)) = decode_event(&text) else {
            panic!("expected a breakpoint hit");
        };
        assert_eq!(hit.thread_id(), Some("w1-x"));
        assert_eq!(hit.location.package_path, ".");
        assert_eq!(hit.frames[0].line_id, 5);
        assert_eq!(hit.frames[0].variables[1].value, "42");
        assert_eq!(hit.frames[0].variables[1].scope, ScopeKind::Global);
    }

    #[test]
    fn test_decode_end_and_unknown_messages() {
        assert_eq!(
            decode_event(r#"{"code":"EXIT"}"#),
            Some(ChannelEvent::ExecutionEnded)
        );
        assert_eq!(
            decode_event(r#"{"code":"COMPLETE"}"#),
            Some(ChannelEvent::ExecutionEnded)
        );
        assert_eq!(decode_event(r#"{"code":"DEBUG_MODE_ON"}"#), None);
        assert!(matches!(
            decode_event("not json"),
            Some(ChannelEvent::ConnectionError(_))
        ));
    }

    #[test]
    fn test_debug_url() {
        assert_eq!(
            debug_url("127.0.0.1", 9000).unwrap().as_str(),
            "ws://127.0.0.1:9000/debug"
        );
    }

    fn next_channel_event(rx: &crossbeam_channel::Receiver<SessionInput>) -> ChannelEvent {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(SessionInput::Channel(event)) => event,
            other => panic!("expected a channel event, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_flushes_queued_commands_and_delivers_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut received = Vec::new();
            for _ in 0..2 {
                if let Some(Ok(Message::Text(text))) = socket.next().await {
                    received.push(serde_json::from_str::<serde_json::Value>(&text).unwrap());
                }
            }

            let exit = json!({"code": "EXIT"}).to_string();
            socket.send(Message::Text(exit.into())).await.unwrap();
            received
        });

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let client = EventChannelClient::spawn(&tokio::runtime::Handle::current(), events_tx);

        client.send(ChannelCommand::AddBreakpoint {
            line: 3,
            file: "a.bal".to_string(),
            package: ".".to_string(),
        });
        client.send(ChannelCommand::Start);
        client.connect(debug_url("127.0.0.1", port).unwrap());

        let received = server.await.unwrap();
        assert_eq!(received[0]["command"], "SET_POINTS");
        assert_eq!(received[1], json!({"command": "START"}));

        let events_rx_clone = events_rx.clone();
        let events = tokio::task::spawn_blocking(move || {
            vec![
                next_channel_event(&events_rx_clone),
                next_channel_event(&events_rx_clone),
            ]
        })
        .await
        .unwrap();
        assert_eq!(events[0], ChannelEvent::Opened);
        assert_eq!(events[1], ChannelEvent::ExecutionEnded);

        client.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_reports_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let client = EventChannelClient::spawn(&tokio::runtime::Handle::current(), events_tx);
        client.connect(debug_url("127.0.0.1", port).unwrap());

        let event = tokio::task::spawn_blocking(move || next_channel_event(&events_rx))
            .await
            .unwrap();
        assert!(matches!(event, ChannelEvent::ConnectionError(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_connects_again_after_failure() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let client = EventChannelClient::spawn(&tokio::runtime::Handle::current(), events_tx);
        client.send(ChannelCommand::Start);
        client.connect(debug_url("127.0.0.1", dead_port).unwrap());

        let rx = events_rx.clone();
        let event = tokio::task::spawn_blocking(move || next_channel_event(&rx))
            .await
            .unwrap();
        assert!(matches!(event, ChannelEvent::ConnectionError(_)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    serde_json::from_str::<serde_json::Value>(&text).unwrap()
                }
                other => panic!("expected a text frame, got {:?}", other),
            }
        });

        client.connect(debug_url("127.0.0.1", port).unwrap());

        let event = tokio::task::spawn_blocking(move || next_channel_event(&events_rx))
            .await
            .unwrap();
        assert_eq!(event, ChannelEvent::Opened);
        assert_eq!(server.await.unwrap(), json!({"command": "START"}));

        client.close();
    }
}
