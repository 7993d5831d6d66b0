use thiserror::Error;

/// Errors that may occur in this library.
///
/// Every variant carries a message meant for the client,
/// which the HTTP front end sends back verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The device configuration could not be read or parsed.
    #[error("{0}")]
    BadConfig(String),

    /// A device refers to a driver which does not exist.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// A driver parameter is missing or has a bad value.
    #[error("{0}")]
    BadParameter(String),

    /// Device does not exist.
    #[error("unknown device: {0}")]
    NoSuchDevice(String),

    /// The requested action is not known.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The user did something which is not valid.
    /// For example, asked a device without naming it.
    #[error("{0}")]
    BadUsage(String),

    /// A program did not follow the Simple Pipe Protocol.
    #[error("{0}")]
    Protocol(String),

    /// The device reported an error (`#Error: ...`).
    #[error("{0}")]
    DeviceError(String),

    /// The device reported a fatal error (`#Fatal: ...`).
    #[error("{0}")]
    DeviceFatal(String),

    /// Another connection holds the device exclusively.
    #[error("device is locked")]
    Locked,

    /// The device can not be locked because others use it.
    #[error("Can't lock the device: it is in use")]
    InUse,

    /// Unlock was requested but the device is not locked.
    #[error("device is not locked")]
    NotLocked,

    /// Unlock was requested by a connection not holding the lock.
    #[error("device is locked by another connection")]
    LockedByOther,

    /// Log buffer was requested without starting logging first.
    #[error("Logging is off")]
    LoggingOff,

    /// A connection name is already used by another connection.
    #[error("connection name is already in use: {0}")]
    NameTaken(String),

    /// Pipes, processes, ports: getting bytes to and from the device failed.
    #[error("{0}")]
    Transport(String),

    /// Waiting for the device took too long.
    #[error("{0}")]
    Timeout(String),

    /// The driver was used while not open.
    #[error("{0}")]
    Closed(String),
}

/// Broad classes of [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed configuration, unknown device or driver, bad parameter.
    Configuration,

    /// The program behind a device broke the framing protocol.
    Protocol,

    /// The device itself reported a problem.
    Device,

    /// Locking and exclusivity conflicts between connections.
    Concurrency,

    /// Process, pipe or port failures, timeouts.
    Transport,

    /// The request itself was malformed.
    Usage,
}

impl Error {
    /// Which class of error this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadConfig(_)
            | Error::UnknownDriver(_)
            | Error::BadParameter(_)
            | Error::NoSuchDevice(_) => ErrorKind::Configuration,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::DeviceError(_) | Error::DeviceFatal(_) => ErrorKind::Device,
            Error::Locked
            | Error::InUse
            | Error::NotLocked
            | Error::LockedByOther
            | Error::NameTaken(_) => ErrorKind::Concurrency,
            Error::Transport(_) | Error::Timeout(_) | Error::Closed(_) => ErrorKind::Transport,
            Error::UnknownAction(_) | Error::BadUsage(_) | Error::LoggingOff => ErrorKind::Usage,
        }
    }

    /// If this is a [`Error::BadConfig`], get the message.
    pub fn try_into_bad_config(self) -> std::result::Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

/// A fallible result with this library's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
