use std::{fmt::Display, str::FromStr};

use crate::error::Error;

/// Actions a connection can ask of the server.
///
/// On the wire an action is the first part of the request path,
/// e.g. `/ask/<device>/<message>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Send a message to a device, get the answer.
    Ask,

    /// Start using a device, opening it if needed.
    Use,

    /// Stop using a device, closing it if nobody else uses it.
    Release,

    /// Use a device exclusively.
    Lock,

    /// Stop using a device exclusively.
    Unlock,

    /// Start logging a device's traffic.
    LogStart,

    /// Stop logging a device's traffic.
    LogFinish,

    /// Get (and clear) the logged traffic.
    LogGet,

    /// Describe a device.
    Info,

    /// List configured devices.
    /// Also known as `list`.
    Devices,

    /// Read the device list again.
    Reload,

    /// Check that the server is alive.
    Ping,

    /// Server time, seconds since the Unix epoch.
    GetTime,

    /// Give the connection a name.
    SetConnName,

    /// The name of this connection.
    GetConnName,

    /// Names of all open connections.
    ListConnNames,

    /// Release all devices used by this connection.
    ReleaseAll,
}

impl Action {
    /// Every action.
    pub const ALL: [Action; 17] = [
        Action::Ask,
        Action::Use,
        Action::Release,
        Action::Lock,
        Action::Unlock,
        Action::LogStart,
        Action::LogFinish,
        Action::LogGet,
        Action::Info,
        Action::Devices,
        Action::Reload,
        Action::Ping,
        Action::GetTime,
        Action::SetConnName,
        Action::GetConnName,
        Action::ListConnNames,
        Action::ReleaseAll,
    ];

    /// The name used in requests.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Ask => "ask",
            Action::Use => "use",
            Action::Release => "release",
            Action::Lock => "lock",
            Action::Unlock => "unlock",
            Action::LogStart => "log_start",
            Action::LogFinish => "log_finish",
            Action::LogGet => "log_get",
            Action::Info => "info",
            Action::Devices => "devices",
            Action::Reload => "reload",
            Action::Ping => "ping",
            Action::GetTime => "get_time",
            Action::SetConnName => "set_conn_name",
            Action::GetConnName => "get_conn_name",
            Action::ListConnNames => "list_conn_names",
            Action::ReleaseAll => "release_all",
        }
    }

    /// True if the action operates on a single device.
    pub fn targets_device(&self) -> bool {
        matches!(
            self,
            Action::Ask
                | Action::Use
                | Action::Release
                | Action::Lock
                | Action::Unlock
                | Action::LogStart
                | Action::LogFinish
                | Action::LogGet
                | Action::Info
        )
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "list" {
            return Ok(Action::Devices);
        }

        Action::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_owned()))
    }
}
