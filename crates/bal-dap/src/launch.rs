use std::io::{self, BufRead, BufReader, Read};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::error::BalAdapterError;
use crate::package;
use crate::protocol::{ProcessEvent, SessionInput};

pub const MISSING_HOME_MESSAGE: &str = "Couldn't start the debug server. Please set ballerina.home.";
pub const NO_PORT_MESSAGE: &str = "Couldn't find an open port to start the debug server.";
pub const SPAWN_FAILED_MESSAGE: &str = "Could not start the debug server.";
pub const COMPILE_FAILED_MESSAGE: &str = "Failed to compile.";

/// What to run and where to run it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    pub working_dir: PathBuf,
    pub target: String,
}

impl RunTarget {
    /// A file in package `a.b` lives in `<root>/a/b/`; the runtime is started from
    /// `<root>` with the package path as target. Files without a package run by name
    /// from their own directory.
    pub fn resolve(entry: &Path, declared_package: Option<&str>) -> Self {
        let mut working_dir = match entry.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        match declared_package {
            Some(declared) => {
                let segments: Vec<&str> = package::segments(declared).collect();
                for _ in &segments {
                    if let Some(parent) = working_dir.parent() {
                        working_dir = parent.to_path_buf();
                    }
                }
                let target: PathBuf = segments.iter().collect();
                Self {
                    working_dir,
                    target: target.to_string_lossy().to_string(),
                }
            }
            None => Self {
                working_dir,
                target: entry
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub port: u16,
}

impl LaunchPlan {
    pub fn new(runtime_home: &Path, run: RunTarget, port: u16) -> Self {
        Self {
            executable: executable_path(runtime_home),
            args: vec![
                "run".to_string(),
                run.target,
                "--debug".to_string(),
                port.to_string(),
            ],
            working_dir: run.working_dir,
            port,
        }
    }
}

pub fn executable_path(runtime_home: &Path) -> PathBuf {
    let name = if cfg!(windows) {
        "ballerina.bat"
    } else {
        "ballerina"
    };
    runtime_home.join("bin").join(name)
}

/// Asks the OS for a free local port. The listener is released before returning.
pub fn find_free_port() -> Result<u16, BalAdapterError> {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| {
            error!(error = %e, "Failed to allocate a debug port");
            BalAdapterError::PortAllocation(NO_PORT_MESSAGE.to_string())
        })
}

/// True when `line` announces the remote debugger listening on `port`.
pub fn is_activation_line(line: &str, marker: &str, port: u16) -> bool {
    line.find(marker)
        .is_some_and(|at| line[at + marker.len()..].contains(&port.to_string()))
}

#[derive(Debug)]
pub struct DebugServerProcess {
    child: Child,
}

impl DebugServerProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Kills the runtime unless it already exited. Safe to call more than once.
    pub fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!(%status, "Debug server already exited"),
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!(error = %e, "Failed to kill debug server");
                }
                let _ = self.child.wait();
            }
        }
    }
}

impl Drop for DebugServerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Starts the runtime and forwards its output, line by line, to the session.
pub fn spawn(
    plan: &LaunchPlan,
    events: Sender<SessionInput>,
) -> Result<DebugServerProcess, BalAdapterError> {
    info!(
        executable = %plan.executable.display(),
        args = ?plan.args,
        cwd = %plan.working_dir.display(),
        "Starting debug server"
    );

    let mut child = Command::new(&plan.executable)
        .args(&plan.args)
        .current_dir(&plan.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!(error = %e, "Failed to spawn debug server");
            BalAdapterError::Launch(SPAWN_FAILED_MESSAGE.to_string())
        })?;

    if let Some(stdout) = child.stdout.take() {
        let events = events.clone();
        thread::spawn(move || {
            forward_lines(stdout, &events, ProcessEvent::Stdout);
            let _ = events.send(SessionInput::Process(ProcessEvent::StdoutClosed));
        });
    }

    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || forward_lines(stderr, &events, ProcessEvent::Stderr));
    }

    Ok(DebugServerProcess { child })
}

/// Forwards output line by line until EOF. Bytes that are not UTF-8 are replaced,
/// never dropped.
fn forward_lines<R: Read>(
    reader: R,
    events: &Sender<SessionInput>,
    wrap: fn(String) -> ProcessEvent,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if events.send(SessionInput::Process(wrap(line))).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Stopped reading debug server output");
                return;
            }
        }
    }
}
