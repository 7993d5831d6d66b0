#![deny(missing_docs)]

//! Device Broker shares instruments between many clients over HTTP.
//!
//! Devices are listed in a configuration file, each with a driver and driver parameters.
//! A device is opened when the first connection starts using it, and closed again
//! when the last connection using it releases it (or goes away).
//!
//! Requests look like `/<action>/<device>/<message>`, for example `/ask/psu/VOLT?`.
//! The answer is the response body, errors get status 400.

/// The actions that can be requested by a connection.
pub mod actions;

/// Code relating to setting up the server which accepts connections and routes their requests.
pub mod server;

/// The command line interface.
pub mod cli;

/// Relates to settings and device list files.
pub mod config;

/// Identifies connections.
pub mod connection;

/// A device shared by connections.
pub mod device;

/// Owns the devices and dispatches actions to them.
pub mod manager;

/// Drivers for the different kinds of devices.
pub mod driver;

/// Talking to a child process through pipes.
pub mod bridge;

/// Locks identified by name.
pub mod named_lock;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
