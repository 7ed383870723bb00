use std::fmt;
use std::io;

use chanprims_alloc::AllocError;
use chanprims_session::SessionError;

// Exit code constants.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const CHANNELS_EXHAUSTED: i32 = 20;
pub const CHANNEL_IN_USE: i32 = 21;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn alloc_error_code(err: &AllocError) -> i32 {
    match err {
        AllocError::ChannelsExhausted => CHANNELS_EXHAUSTED,
        AllocError::ChannelInUse(_) => CHANNEL_IN_USE,
        AllocError::InvalidChannelNumber { .. } => USAGE,
    }
}

pub fn session_error_code(err: &SessionError) -> i32 {
    match err {
        SessionError::Alloc(err) => alloc_error_code(err),
        SessionError::UnknownChannel(_) => FAILURE,
        SessionError::SessionExists(_) => CHANNEL_IN_USE,
        SessionError::Config(_) => USAGE,
        SessionError::Json(_) => DATA_INVALID,
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    CliError::new(session_error_code(&err), format!("{context}: {err}"))
}
