use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FleetError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("VM '{name}' has no provisioning source")]
    #[diagnostic(help("set one of `template`, `pvm`, `snapshot_vm` + `snapshot_id`, or `iso`"))]
    NoSourceSpecified { name: String },

    #[error("VM '{vm}' starts after unknown VM '{dependency}'")]
    UnknownDependency { vm: String, dependency: String },

    #[error("start_after dependency cycle between: {}", members.join(", "))]
    DependencyCycle { members: Vec<String> },

    #[error("no ISO mastering tool found (tried: {})", candidates.join(", "))]
    #[diagnostic(help("install genisoimage or mkisofs (cdrtools) and make sure it is on PATH"))]
    ToolingUnavailable { candidates: Vec<String> },

    #[error("{program} failed to build seed image {path} (exit {code}): {stderr}")]
    SeedBuild {
        program: String,
        path: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    HypervisorCommand {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to configure VM '{name}': {}", failures.join("; "))]
    #[diagnostic(help("settings applied before the failure were kept; rerun `up` once fixed"))]
    Configure { name: String, failures: Vec<String> },

    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("provisioning task for '{name}' aborted: {message}")]
    TaskAborted { name: String, message: String },

    #[error("{what} was cancelled")]
    Cancelled { what: String },

    #[error("failed to serialize {what}: {message}")]
    Serialize { what: String, message: String },
}
