use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in doas
#[derive(Error, Debug)]
pub enum DoasError {
    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}: {reason}")]
    ConfigInsecure { path: PathBuf, reason: String },

    #[error("Failed to parse settings: {0}")]
    SettingsParse(String),

    #[error("{path}:{line}: {kind}")]
    Parse {
        path: PathBuf,
        line: usize,
        kind: ParseErrorKind,
    },

    #[error("Failed to read group database {path}: {source}")]
    GroupDatabase {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Every authorization failure renders identically.
    #[error("not authorized")]
    NotAuthorized,

    #[error("Authentication failed")]
    Authentication(String),

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Failed to change identity: {0}")]
    Privilege(String),

    #[error("Timestamp record error: {0}")]
    Timestamp(String),

    #[error("Failed to read process status {path}: {reason}")]
    ProcStat { path: PathBuf, reason: String },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("{0}: command not found")]
    CommandNotFound(String),

    #[error("Failed to execute {program}: {source}")]
    CommandExecution {
        program: String,
        source: std::io::Error,
    },

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single rule line is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("invalid entry: missing permit|deny")]
    MissingAction,

    #[error("invalid entry: missing identity")]
    MissingIdentity,

    #[error("invalid entry: cmd keyword present but no command")]
    DanglingCmd,

    #[error("invalid entry: unexpected token '{0}'")]
    UnexpectedToken(String),
}

impl DoasError {
    /// Process exit status for this error.
    ///
    /// Policy, authentication and privilege failures all exit 1. Lookup and
    /// exec failures of the target command follow shell conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            DoasError::CommandNotFound(_) => 127,
            DoasError::CommandExecution { .. } => 126,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, DoasError>;
