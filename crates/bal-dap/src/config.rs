use std::path::PathBuf;

/// Number of stack frames per thread that the variables-reference encoding can address.
pub const DEFAULT_FRAME_LIMIT: i64 = 1000;

/// Printed by the runtime once its remote debugger listens on the debug port.
pub const ACTIVATION_MARKER: &str = "Ballerina remote debugger is activated on port";

/// Printed by the runtime on stderr when the target does not compile.
pub const COMPILE_ERROR_MARKER: &str = "compilation contains errors";

/// Environment variable holding the tracing filter.
pub const LOG_ENV: &str = "BAL_DAP_LOG";

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub frame_limit: i64,
    /// Runtime installation used when the launch request does not name one.
    pub default_runtime_home: Option<PathBuf>,
    pub activation_marker: String,
    pub compile_error_marker: String,
    pub log_level: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        let log_level = "bal_dap=debug";
        #[cfg(not(debug_assertions))]
        let log_level = "bal_dap=info";

        Self {
            frame_limit: DEFAULT_FRAME_LIMIT,
            default_runtime_home: None,
            activation_marker: ACTIVATION_MARKER.to_string(),
            compile_error_marker: COMPILE_ERROR_MARKER.to_string(),
            log_level: log_level.to_string(),
        }
    }
}
