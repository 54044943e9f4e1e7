use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;

/// Status codes carried on the wire in error-flagged replies.
///
/// Codes below [`Status::APPLICATION_BASE`] are reserved for the transport.
/// Handlers that need their own failure codes should use
/// [`Status::Application`] with a value at or above the base so they never
/// collide with a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    UnknownCommand,
    MalformedPayload,
    FrameTooLarge,
    NotConnected,
    ConnectFailed,
    Disconnected,
    Cancelled,
    HandlerFailed,
    InvalidProtocol,
    InvalidArgument,
    TimedOut,
    /// A status code the transport does not interpret.
    Application(u32),
}

impl Status {
    /// First code available to applications.
    pub const APPLICATION_BASE: u32 = 0x100;

    /// Returns the wire representation of this status.
    pub fn code(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::UnknownCommand => 1,
            Status::MalformedPayload => 2,
            Status::FrameTooLarge => 3,
            Status::NotConnected => 4,
            Status::ConnectFailed => 5,
            Status::Disconnected => 6,
            Status::Cancelled => 7,
            Status::HandlerFailed => 8,
            Status::InvalidProtocol => 9,
            Status::InvalidArgument => 10,
            Status::TimedOut => 11,
            Status::Application(code) => code,
        }
    }

    /// Maps a wire code back to a status. Unrecognised codes become
    /// [`Status::Application`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::UnknownCommand,
            2 => Status::MalformedPayload,
            3 => Status::FrameTooLarge,
            4 => Status::NotConnected,
            5 => Status::ConnectFailed,
            6 => Status::Disconnected,
            7 => Status::Cancelled,
            8 => Status::HandlerFailed,
            9 => Status::InvalidProtocol,
            10 => Status::InvalidArgument,
            11 => Status::TimedOut,
            other => Status::Application(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "Success"),
            Status::UnknownCommand => write!(f, "Unknown command"),
            Status::MalformedPayload => write!(f, "Malformed payload"),
            Status::FrameTooLarge => write!(f, "Frame exceeds the maximum payload length"),
            Status::NotConnected => write!(f, "Connection is not connected"),
            Status::ConnectFailed => write!(f, "Connect failed"),
            Status::Disconnected => write!(f, "Connection closed"),
            Status::Cancelled => write!(f, "Call cancelled"),
            Status::HandlerFailed => write!(f, "Request handler failed"),
            Status::InvalidProtocol => write!(f, "Call does not match the protocol"),
            Status::InvalidArgument => write!(f, "Invalid argument"),
            Status::TimedOut => write!(f, "Call timed out"),
            Status::Application(code) => write!(f, "Application status {}", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum MinirpcError {
    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame payload of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed before a reply arrived")]
    Disconnected,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Call timed out after {0}ms")]
    Timeout(u64),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Command {command} does not match the protocol: {detail}")]
    InvalidProtocol { command: u32, detail: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Outbound queue is full ({0} frames)")]
    QueueFull(usize),

    #[error("Remote error: {0}")]
    Remote(Status),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MinirpcError {
    /// Maps this error onto the wire status taxonomy.
    pub fn status(&self) -> Status {
        match self {
            MinirpcError::UnknownCommand(_) => Status::UnknownCommand,
            MinirpcError::Codec(_) | MinirpcError::MalformedFrame(_) => Status::MalformedPayload,
            MinirpcError::FrameTooLarge { .. } => Status::FrameTooLarge,
            MinirpcError::NotConnected => Status::NotConnected,
            MinirpcError::ConnectFailed(_) => Status::ConnectFailed,
            MinirpcError::Disconnected | MinirpcError::Io(_) => Status::Disconnected,
            MinirpcError::Cancelled => Status::Cancelled,
            MinirpcError::Timeout(_) => Status::TimedOut,
            MinirpcError::HandlerFailed(_) => Status::HandlerFailed,
            MinirpcError::InvalidProtocol { .. } => Status::InvalidProtocol,
            MinirpcError::InvalidArgument(_) | MinirpcError::QueueFull(_) => Status::InvalidArgument,
            MinirpcError::Remote(status) => *status,
        }
    }
}

pub type Result<T> = std::result::Result<T, MinirpcError>;
