//! The debug session: one state machine fed by IDE requests, debug server events
//! and runtime output.
//!
//! Every input produces a list of [`Action`]s. The session itself performs no I/O
//! beyond reading source headers and picking a port, which keeps the transition
//! table testable on its own.

use std::collections::HashMap;
use std::path::PathBuf;

use dap::prelude::*;
use dap::requests::{SetBreakpointsArguments, StackTraceArguments};
use dap::responses::{
    ContinueResponse, ScopesResponse, SetBreakpointsResponse, SetExceptionBreakpointsResponse,
    StackTraceResponse, ThreadsResponse, VariablesResponse,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::breakpoints::BreakpointRegistry;
use crate::channel::{self, ChannelCommand, ChannelEvent, DebugHit, Frame};
use crate::config::AdapterConfig;
use crate::error::BalAdapterError;
use crate::launch::{self, LaunchPlan, RunTarget};
use crate::mapping::{HandleScheme, ScopeKind, ThreadTable, VariablesHandle};
use crate::package;
use crate::protocol::{Action, AttachArgs, LaunchArgs, ProcessEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Attaching,
    Launching,
    Configuring,
    Running,
    Stopped,
    Terminated,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, Attaching | Launching) => true,
            // an attach that never connected may be retried
            (Attaching, Initializing) => true,
            (Attaching | Launching, Configuring) => true,
            (Configuring, Running) => true,
            // another thread may stop while one is already stopped
            (Running | Stopped, Running | Stopped) => true,
            _ => false,
        }
    }
}

enum Reply {
    Body(ResponseBody),
    /// Answered later, once the debug server connection opens.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
enum Resume {
    Continue,
    StepOver,
    StepIn,
    StepOut,
}

pub struct Session {
    config: AdapterConfig,
    phase: Phase,
    handles: HandleScheme,
    threads: ThreadTable,
    breakpoints: BreakpointRegistry,
    snapshots: HashMap<String, DebugHit>,
    pending: Option<Request>,
    /// Port the launched runtime was told to listen on, until its activation is seen.
    debug_port: Option<u16>,
    spawned: bool,
    terminated: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(AdapterConfig::default())
    }
}

impl Session {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            handles: HandleScheme::new(config.frame_limit),
            config,
            phase: Phase::Uninitialized,
            threads: ThreadTable::default(),
            breakpoints: BreakpointRegistry::default(),
            snapshots: HashMap::new(),
            pending: None,
            debug_port: None,
            spawned: false,
            terminated: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    pub fn snapshot(&self, thread_id: &str) -> Option<&DebugHit> {
        self.snapshots.get(thread_id)
    }

    /// Handle DAP request and return the resulting actions
    pub fn handle_request(&mut self, req: Request) -> Vec<Action> {
        debug!(seq = req.seq, command = ?req.command, "Received request");

        let mut actions = Vec::new();
        let is_disconnect = matches!(req.command, Command::Disconnect(_));

        match self.dispatch(&req.command, &mut actions) {
            Ok(Reply::Body(body)) => actions.push(Action::Respond(req.success(body))),
            Ok(Reply::Deferred) => self.pending = Some(req),
            Err(e) => {
                error!(error = %e, "Failed to handle DAP request");
                let message = e.to_string();
                if e.is_terminal() {
                    self.fail_session(&message, &mut actions);
                }
                actions.push(Action::Respond(req.error(&message)));
            }
        }

        if is_disconnect {
            actions.push(Action::Shutdown);
        }
        actions
    }

    /// Handle debug server events and return the resulting actions
    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.terminated {
            debug!(?event, "Ignoring debug server event after termination");
            return actions;
        }

        match event {
            ChannelEvent::Opened => self.on_connected(&mut actions),
            ChannelEvent::BreakpointHit(hit) => self.on_breakpoint_hit(*hit, &mut actions),
            ChannelEvent::ExecutionEnded => {
                info!("Debug target finished");
                self.finish(&mut actions);
            }
            ChannelEvent::ConnectionError(message) => {
                warn!(error = %message, "Debug server connection error");
                actions.push(Action::Emit(output_event(
                    message.clone(),
                    types::OutputEventCategory::Console,
                )));
                if let Some(req) = self.pending.take() {
                    if matches!(req.command, Command::Attach(_))
                        && let Err(e) = self.transition(Phase::Initializing)
                    {
                        warn!(error = %e, "Could not reset the failed attach");
                    }
                    let message = format!("Could not connect to the debug server: {}", message);
                    actions.push(Action::Respond(req.error(&message)));
                }
            }
        }
        actions
    }

    /// Handle output of the launched runtime and return the resulting actions
    pub fn handle_process_event(&mut self, event: ProcessEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.terminated {
            return actions;
        }

        match event {
            ProcessEvent::Stdout(line) => {
                let activated = self.phase == Phase::Launching
                    && self.debug_port.is_some_and(|port| {
                        launch::is_activation_line(&line, &self.config.activation_marker, port)
                    });

                if let Some(port) = self.debug_port.take_if(|_| activated) {
                    info!(port, "Debug server activated");
                    match channel::debug_url("127.0.0.1", port) {
                        Ok(url) => actions.push(Action::Connect(url)),
                        Err(e) => self.fail_session(&e.to_string(), &mut actions),
                    }
                }

                actions.push(Action::Emit(output_event(
                    format!("{}\n", line),
                    types::OutputEventCategory::Stdout,
                )));
            }
            ProcessEvent::Stderr(line) => {
                if line.contains(&self.config.compile_error_marker) {
                    self.fail_session(launch::COMPILE_FAILED_MESSAGE, &mut actions);
                } else {
                    actions.push(Action::Emit(output_event(
                        format!("{}\n", line),
                        types::OutputEventCategory::Stderr,
                    )));
                }
            }
            ProcessEvent::StdoutClosed => {
                if self.phase == Phase::Launching && self.debug_port.is_some() {
                    warn!("Debug server exited before activation");
                    self.fail_session(launch::SPAWN_FAILED_MESSAGE, &mut actions);
                }
            }
            ProcessEvent::SpawnFailed(message) => self.fail_session(&message, &mut actions),
        }
        actions
    }

    fn dispatch(
        &mut self,
        command: &Command,
        actions: &mut Vec<Action>,
    ) -> Result<Reply, BalAdapterError> {
        match command {
            Command::Initialize(_) => self.initialize(),
            Command::Attach(args) => self.attach(args.additional_data.as_ref(), actions),
            Command::Launch(args) => self.launch(args.additional_data.as_ref(), actions),
            Command::SetBreakpoints(args) => self.set_breakpoints(args, actions),
            Command::SetExceptionBreakpoints(_) => Ok(Reply::Body(
                ResponseBody::SetExceptionBreakpoints(SetExceptionBreakpointsResponse {
                    breakpoints: None,
                }),
            )),
            Command::ConfigurationDone => {
                self.transition(Phase::Running)?;
                actions.push(Action::Channel(ChannelCommand::Start));
                Ok(Reply::Body(ResponseBody::ConfigurationDone))
            }
            Command::Threads => Ok(Reply::Body(self.thread_list())),
            Command::StackTrace(args) => self.stack_trace(args).map(Reply::Body),
            Command::Scopes(args) => self.scopes(args.frame_id).map(Reply::Body),
            Command::Variables(args) => self.variables(args.variables_reference).map(Reply::Body),
            Command::Continue(args) => self.resume(args.thread_id, Resume::Continue, actions),
            Command::Next(args) => self.resume(args.thread_id, Resume::StepOver, actions),
            Command::StepIn(args) => self.resume(args.thread_id, Resume::StepIn, actions),
            Command::StepOut(args) => self.resume(args.thread_id, Resume::StepOut, actions),
            Command::Disconnect(_) => {
                self.disconnect(actions);
                Ok(Reply::Body(ResponseBody::Disconnect))
            }
            command => Err(BalAdapterError::UnhandledCommand(command.clone())),
        }
    }

    fn transition(&mut self, next: Phase) -> Result<(), BalAdapterError> {
        if !self.phase.can_transition_to(next) {
            return Err(BalAdapterError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }

        debug!(from = ?self.phase, to = ?next, "Session transition");
        self.phase = next;
        Ok(())
    }

    fn initialize(&mut self) -> Result<Reply, BalAdapterError> {
        self.transition(Phase::Initializing)?;
        self.threads = ThreadTable::default();
        self.breakpoints = BreakpointRegistry::default();
        self.snapshots.clear();

        let capabilities = types::Capabilities {
            supports_configuration_done_request: Some(true),
            ..Default::default()
        };
        Ok(Reply::Body(ResponseBody::Initialize(capabilities)))
    }

    fn attach(
        &mut self,
        raw_args: Option<&serde_json::Value>,
        actions: &mut Vec<Action>,
    ) -> Result<Reply, BalAdapterError> {
        let args: AttachArgs = parse_args(raw_args)?;
        let url = channel::debug_url(&args.host, args.port)?;
        self.transition(Phase::Attaching)?;

        info!(url = %url, "Attaching to debug server");
        actions.push(Action::Connect(url));
        Ok(Reply::Deferred)
    }

    fn launch(
        &mut self,
        raw_args: Option<&serde_json::Value>,
        actions: &mut Vec<Action>,
    ) -> Result<Reply, BalAdapterError> {
        let args: LaunchArgs = parse_args(raw_args)?;
        debug!(?args, "Received launch request");

        if !self.phase.can_transition_to(Phase::Launching) {
            return Err(BalAdapterError::InvalidTransition {
                from: self.phase,
                to: Phase::Launching,
            });
        }

        let runtime_home = args
            .runtime_home
            .or_else(|| self.config.default_runtime_home.clone())
            .ok_or_else(|| BalAdapterError::Configuration(launch::MISSING_HOME_MESSAGE.to_string()))?;

        let declared = package::read_declared_package(&args.script)?;
        let run = RunTarget::resolve(&args.script, declared.as_deref());
        let port = launch::find_free_port()?;
        let plan = LaunchPlan::new(&runtime_home, run, port);

        self.transition(Phase::Launching)?;
        self.debug_port = Some(port);
        self.spawned = true;
        actions.push(Action::Spawn(plan));
        Ok(Reply::Deferred)
    }

    fn set_breakpoints(
        &mut self,
        args: &SetBreakpointsArguments,
        actions: &mut Vec<Action>,
    ) -> Result<Reply, BalAdapterError> {
        let path = args.source.path.as_ref().map(PathBuf::from).ok_or_else(|| {
            BalAdapterError::ProtocolError("setBreakpoints requires a source path".to_string())
        })?;
        let name = args
            .source
            .name
            .clone()
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();
        let lines: Vec<i64> = args.breakpoints.iter().flatten().map(|bp| bp.line).collect();

        let commands = self.breakpoints.set_breakpoints(&path, &name, &lines)?;
        actions.extend(commands.into_iter().map(Action::Channel));

        // The debug server does not validate lines up front.
        let breakpoints = lines
            .iter()
            .enumerate()
            .map(|(id, line)| types::Breakpoint {
                verified: true,
                line: Some(*line),
                column: None,
                end_line: None,
                end_column: None,
                source: Some(args.source.clone()),
                message: None,
                id: Some(id as i64),
                instruction_reference: None,
                offset: None,
            })
            .collect();

        Ok(Reply::Body(ResponseBody::SetBreakpoints(
            SetBreakpointsResponse { breakpoints },
        )))
    }

    fn thread_list(&self) -> ResponseBody {
        let threads = self
            .threads
            .threads()
            .iter()
            .map(|thread| types::Thread {
                id: thread.index,
                name: thread.name.clone(),
            })
            .collect();
        ResponseBody::Threads(ThreadsResponse { threads })
    }

    fn stack_trace(&self, args: &StackTraceArguments) -> Result<ResponseBody, BalAdapterError> {
        let thread_id = self.threads.thread_id(args.thread_id)?;
        let snapshot = self
            .snapshots
            .get(thread_id)
            .ok_or(BalAdapterError::NoSnapshot)?;

        let start = args.start_frame.unwrap_or(0).max(0) as usize;
        let levels = match args.levels {
            Some(levels) if levels > 0 => levels as usize,
            _ => usize::MAX,
        };

        let stack_frames = snapshot
            .frames
            .iter()
            .enumerate()
            .skip(start)
            .take(levels)
            .map(|(id, frame)| self.stack_frame(id, frame, &snapshot.location.package_path))
            .collect();

        Ok(ResponseBody::StackTrace(StackTraceResponse {
            stack_frames,
            total_frames: Some(snapshot.frames.len() as i64),
        }))
    }

    fn stack_frame(&self, id: usize, frame: &Frame, package_path: &str) -> types::StackFrame {
        let path = self
            .breakpoints
            .resolve_frame_path(package_path, &frame.file_name)
            .map(|path| path.to_string_lossy().to_string());

        types::StackFrame {
            id: id as i64,
            name: frame.frame_name.clone(),
            line: frame.line_id,
            column: 0,
            source: Some(types::Source {
                name: Some(frame.file_name.clone()),
                path,
                adapter_data: None,
                source_reference: None,
                presentation_hint: None,
                origin: None,
                checksums: None,
                sources: None,
            }),
            ..Default::default()
        }
    }

    fn scopes(&self, frame_id: i64) -> Result<ResponseBody, BalAdapterError> {
        let frame_index = usize::try_from(frame_id)
            .map_err(|_| BalAdapterError::ProtocolError(format!("Invalid frame id: {}", frame_id)))?;

        let scopes = [ScopeKind::Local, ScopeKind::Global]
            .into_iter()
            .map(|scope| {
                let variables_reference = self
                    .handles
                    .encode(VariablesHandle::new(frame_index, scope))?;
                Ok(types::Scope {
                    name: scope.name().to_string(),
                    variables_reference,
                    expensive: false,
                    named_variables: None,
                    indexed_variables: None,
                    source: None,
                    line: None,
                    column: None,
                    end_line: None,
                    end_column: None,
                    presentation_hint: None,
                })
            })
            .collect::<Result<Vec<_>, BalAdapterError>>()?;

        Ok(ResponseBody::Scopes(ScopesResponse { scopes }))
    }

    /// Variables of the current thread's snapshot. Values are never expandable.
    fn variables(&self, reference: i64) -> Result<ResponseBody, BalAdapterError> {
        let handle = self.handles.decode(reference)?;
        let snapshot = self
            .threads
            .current()
            .and_then(|thread_id| self.snapshots.get(thread_id))
            .ok_or(BalAdapterError::NoSnapshot)?;
        let frame = snapshot
            .frames
            .get(handle.frame_index)
            .ok_or(BalAdapterError::UnknownHandle(reference))?;

        let variables = frame
            .variables
            .iter()
            .filter(|variable| variable.scope == handle.scope)
            .map(|variable| types::Variable {
                name: variable.name.clone(),
                value: variable.value.clone(),
                type_field: Some("integer".to_string()),
                variables_reference: 0,
                named_variables: None,
                indexed_variables: None,
                presentation_hint: None,
                evaluate_name: Some(variable.name.clone()),
                memory_reference: None,
            })
            .collect();

        Ok(ResponseBody::Variables(VariablesResponse { variables }))
    }

    fn resume(
        &mut self,
        thread_index: i64,
        resume: Resume,
        actions: &mut Vec<Action>,
    ) -> Result<Reply, BalAdapterError> {
        let thread_id = self.threads.thread_id(thread_index)?.to_string();
        self.transition(Phase::Running)?;
        debug!(thread = %thread_id, ?resume, "Resuming thread");

        let (command, body) = match resume {
            Resume::Continue => {
                actions.push(Action::Emit(Event::Continued(events::ContinuedEventBody {
                    thread_id: thread_index,
                    all_threads_continued: Some(false),
                })));
                (
                    ChannelCommand::Resume(thread_id),
                    ResponseBody::Continue(ContinueResponse {
                        all_threads_continued: Some(false),
                    }),
                )
            }
            Resume::StepOver => (ChannelCommand::StepOver(thread_id), ResponseBody::Next),
            Resume::StepIn => (ChannelCommand::StepIn(thread_id), ResponseBody::StepIn),
            Resume::StepOut => (ChannelCommand::StepOut(thread_id), ResponseBody::StepOut),
        };

        actions.push(Action::Channel(command));
        Ok(Reply::Body(body))
    }

    fn on_connected(&mut self, actions: &mut Vec<Action>) {
        let Some(req) = self.pending.take() else {
            debug!("Debug server connection opened without a pending request");
            return;
        };

        let body = match req.command {
            Command::Launch(_) => ResponseBody::Launch,
            _ => ResponseBody::Attach,
        };

        match self.transition(Phase::Configuring) {
            Ok(()) => {
                info!("Connected to debug server");
                actions.push(Action::Respond(req.success(body)));
                actions.push(Action::Emit(Event::Initialized));
            }
            Err(e) => {
                warn!(error = %e, "Debug server connected in an unexpected state");
                actions.push(Action::Respond(req.error(&e.to_string())));
            }
        }
    }

    fn on_breakpoint_hit(&mut self, hit: DebugHit, actions: &mut Vec<Action>) {
        let Some(thread_id) = hit.thread_id().map(str::to_string) else {
            warn!("Breakpoint hit without a thread id");
            return;
        };

        let index = self.threads.resolve_or_assign(&thread_id);
        let description = format!("Breakpoint hit at line {}", hit.location.line_number);
        debug!(thread = %thread_id, index, "Breakpoint hit");
        self.snapshots.insert(thread_id, hit);

        if let Err(e) = self.transition(Phase::Stopped) {
            warn!(error = %e, "Breakpoint hit outside of a running session");
        }

        actions.push(Action::Emit(Event::Stopped(events::StoppedEventBody {
            reason: types::StoppedEventReason::Breakpoint,
            description: Some(description),
            thread_id: Some(index),
            preserve_focus_hint: None,
            text: None,
            all_threads_stopped: Some(false),
            hit_breakpoint_ids: None,
        })));
    }

    fn disconnect(&mut self, actions: &mut Vec<Action>) {
        info!("Disconnecting debug session");
        let spawned = std::mem::take(&mut self.spawned);

        // An attached runtime keeps running; a launched one is stopped.
        if spawned {
            actions.push(Action::Channel(ChannelCommand::Terminate));
        }
        actions.push(Action::CloseChannel);
        if spawned {
            actions.push(Action::KillProcess);
        }

        if let Some(req) = self.pending.take() {
            actions.push(Action::Respond(req.error("Debug session disconnected")));
        }
        self.finish(actions);
    }

    /// Ends the session with a user-visible message.
    fn fail_session(&mut self, message: &str, actions: &mut Vec<Action>) {
        if self.terminated {
            debug!(message, "Session already terminated");
            return;
        }

        warn!(message, "Ending debug session");
        actions.push(Action::Emit(output_event(
            message,
            types::OutputEventCategory::Console,
        )));
        self.finish(actions);

        if let Some(req) = self.pending.take() {
            actions.push(Action::Respond(req.error(message)));
        }
        actions.push(Action::CloseChannel);
        if std::mem::take(&mut self.spawned) {
            actions.push(Action::KillProcess);
        }
    }

    /// Emits the terminated notification, once per session.
    fn finish(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Terminated;
        if self.terminated {
            return;
        }

        self.terminated = true;
        actions.push(Action::Emit(Event::Terminated(Some(
            events::TerminatedEventBody {
                restart: Some(serde_json::Value::Bool(false)),
            },
        ))));
    }
}

fn parse_args<T: DeserializeOwned>(raw: Option<&serde_json::Value>) -> Result<T, BalAdapterError> {
    let raw = raw.ok_or(BalAdapterError::MissingLaunchArguments)?;
    serde_json::from_value(raw.clone()).map_err(BalAdapterError::LaunchArgumentsError)
}

pub fn output_event(output: impl Into<String>, category: types::OutputEventCategory) -> Event {
    Event::Output(events::OutputEventBody {
        output: output.into(),
        category: Some(category),
        group: None,
        variables_reference: None,
        source: None,
        line: None,
        column: None,
        data: None,
    })
}
