use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use dap::prelude::*;
use dap::responses::Response;
use dap::server::ServerOutput;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::channel::EventChannelClient;
use crate::config::{AdapterConfig, LOG_ENV};
use crate::launch::{self, DebugServerProcess};
use crate::log::DebugConsoleWriter;
use crate::protocol::{Action, ProcessEvent, SessionInput};
use crate::session::{self, Session};

type DynResult<T> = miette::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn start(config: AdapterConfig) -> DynResult<()> {
    let (debug_writer, log_rx) = DebugConsoleWriter::new();

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(debug_writer)
        .init();

    info!("Starting bal-dap debug adapter");

    let reader = BufReader::new(io::stdin());
    let writer = BufWriter::new(io::stdout());
    serve(Server::new(reader, writer), Session::new(config), log_rx)
}

/// Runs one debug session over `server` until the IDE disconnects.
pub fn serve<R, W>(server: Server<R, W>, mut session: Session, logs: Receiver<String>) -> DynResult<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    let output = Arc::clone(&server.output);
    spawn_request_reader(server, input_tx.clone());

    let mut driver = Driver {
        channel: EventChannelClient::spawn(runtime.handle(), input_tx.clone()),
        output,
        process: None,
        inputs: input_tx,
    };

    loop {
        select! {
            recv(logs) -> message => {
                if let Ok(message) = message {
                    driver.forward_log(message);
                }
            }
            recv(input_rx) -> input => {
                let Ok(input) = input else {
                    break;
                };

                let actions = match input {
                    SessionInput::Request(req) => session.handle_request(req),
                    SessionInput::Channel(event) => session.handle_channel_event(event),
                    SessionInput::Process(event) => session.handle_process_event(event),
                    SessionInput::ClientClosed => {
                        info!("Client disconnected or stream ended");
                        break;
                    }
                };

                if !driver.execute(&mut session, actions) {
                    info!("Debug session finished");
                    break;
                }
            }
        }
    }

    driver.channel.close();
    driver.kill_process();
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn spawn_request_reader<R, W>(mut server: Server<R, W>, inputs: Sender<SessionInput>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        loop {
            let input = match server.poll_request() {
                Ok(Some(req)) => SessionInput::Request(req),
                Ok(None) => SessionInput::ClientClosed,
                Err(e) => {
                    error!(error = %e, "Failed to read DAP request");
                    SessionInput::ClientClosed
                }
            };

            let closed = matches!(input, SessionInput::ClientClosed);
            if inputs.send(input).is_err() || closed {
                break;
            }
        }
    });
}

/// Carries out session actions against the IDE stream, the debug server
/// connection and the runtime process.
struct Driver<W: Write> {
    output: Arc<Mutex<ServerOutput<W>>>,
    channel: EventChannelClient,
    process: Option<DebugServerProcess>,
    inputs: Sender<SessionInput>,
}

impl<W: Write> Driver<W> {
    /// Returns `false` once the session asked to shut down.
    fn execute(&mut self, session: &mut Session, actions: Vec<Action>) -> bool {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Respond(response) => self.respond(response),
                Action::Emit(event) => self.emit(event),
                Action::Channel(command) => self.channel.send(command),
                Action::Connect(url) => self.channel.connect(url),
                Action::Spawn(plan) => match launch::spawn(&plan, self.inputs.clone()) {
                    Ok(process) => {
                        info!(pid = process.id(), "Debug server started");
                        self.process = Some(process);
                    }
                    Err(e) => queue.extend(
                        session.handle_process_event(ProcessEvent::SpawnFailed(e.to_string())),
                    ),
                },
                Action::KillProcess => self.kill_process(),
                Action::CloseChannel => self.channel.close(),
                Action::Shutdown => return false,
            }
        }

        true
    }

    fn respond(&self, response: Response) {
        debug!(request_seq = response.request_seq, success = response.success, "Sending response");
        match self.output.lock() {
            Ok(mut output) => {
                if let Err(e) = output.respond(response) {
                    error!(error = %e, "Failed to send response");
                }
            }
            Err(e) => error!(error = %e, "DAP output is unavailable"),
        }
    }

    fn emit(&self, event: Event) {
        match self.output.lock() {
            Ok(mut output) => {
                if let Err(e) = output.send_event(event) {
                    error!(error = %e, "Failed to send event");
                }
            }
            Err(e) => error!(error = %e, "DAP output is unavailable"),
        }
    }

    /// Log lines go straight to the stream; logging here would feed back into itself.
    fn forward_log(&self, message: String) {
        let event = session::output_event(message, types::OutputEventCategory::Console);
        if let Ok(mut output) = self.output.lock()
            && let Err(e) = output.send_event(event)
        {
            eprintln!("Failed to send log output: {}", e);
        }
    }

    fn kill_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            info!(pid = process.id(), "Stopping debug server");
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(message: serde_json::Value) -> String {
        let body = message.to_string();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn test_serve_until_disconnect() {
        let input = [
            frame(json!({
                "seq": 1,
                "type": "request",
                "command": "initialize",
                "arguments": {"adapterID": "ballerina"}
            })),
            frame(json!({
                "seq": 2,
                "type": "request",
                "command": "disconnect",
                "arguments": {}
            })),
        ]
        .concat();

        let buffer = SharedBuffer::default();
        let server = Server::new(
            BufReader::new(Cursor::new(input.into_bytes())),
            BufWriter::new(buffer.clone()),
        );

        let result = serve(server, Session::default(), crossbeam_channel::never());
        assert!(result.is_ok());

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("\"command\":\"initialize\""));
        assert!(written.contains("\"event\":\"terminated\""));
        assert!(written.contains("\"command\":\"disconnect\""));
    }

    #[test]
    fn test_serve_ends_with_input_stream() {
        let buffer = SharedBuffer::default();
        let server = Server::new(
            BufReader::new(Cursor::new(Vec::new())),
            BufWriter::new(buffer.clone()),
        );

        let result = serve(server, Session::default(), crossbeam_channel::never());
        assert!(result.is_ok());
        assert!(buffer.0.lock().unwrap().is_empty());
    }
}
