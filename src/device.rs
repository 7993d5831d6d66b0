//! A configured device, shared by the connections using it.
//!
//! The driver is opened when the first connection starts using the device,
//! and closed when the last one releases it.
//! One connection may lock the device when it is the only user,
//! and any connection may tap the device's traffic.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt::{Display, Write},
};

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    config::devices::DeviceEntry,
    connection::ConnectionId,
    driver::{self, Driver, Params},
    error::{Error, Result},
    named_lock::NamedLock,
};

/// One line of a connection's log of device traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapEntry {
    /// When it happened.
    pub time: DateTime<Local>,

    /// `>> ` for messages sent, `<< ` for answers, `EE ` for errors.
    pub prefix: &'static str,

    /// The message, answer or error.
    pub text: String,
}

impl Display for TapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}",
            self.time.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.prefix,
            self.text
        )
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    users: BTreeSet<ConnectionId>,
    exclusive: Option<ConnectionId>,
    taps: HashMap<ConnectionId, VecDeque<TapEntry>>,
}

/// A device and its driver.
///
/// Locks are always taken in the order `serial`, `driver`, `state`.
#[derive(Debug)]
pub struct Device {
    name: String,
    driver_kind: String,
    driver_args: Params,
    tap_capacity: usize,

    /// Serializes opening, closing and talking to the instrument.
    /// Shared with any other device of the same name,
    /// for example while a reload replaces this one.
    serial: NamedLock,

    /// Present while there are users.
    driver: Mutex<Option<Box<dyn Driver>>>,

    /// Users are only added or removed while holding `serial`.
    state: Mutex<DeviceState>,
}

impl Device {
    /// A closed device.
    pub fn new(entry: DeviceEntry, serial: NamedLock, tap_capacity: usize) -> Self {
        Self {
            name: entry.name,
            driver_kind: entry.driver,
            driver_args: entry.params,
            tap_capacity,
            serial,
            driver: Mutex::new(None),
            state: Mutex::default(),
        }
    }

    /// The name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the driver is open.
    pub async fn is_open(&self) -> bool {
        !self.state.lock().await.users.is_empty()
    }

    /// True if the connection uses the device.
    pub async fn is_used_by(&self, conn: ConnectionId) -> bool {
        self.state.lock().await.users.contains(&conn)
    }

    /// Start using the device, opening it if nobody else does.
    ///
    /// Returns true if this call opened the device.
    pub async fn use_by(&self, conn: ConnectionId) -> Result<bool> {
        {
            let state = self.state.lock().await;
            if state.users.contains(&conn) {
                return Ok(false);
            }
            if state.exclusive.is_some() {
                return Err(Error::Locked);
            }
        }

        let _serial = self.serial.lock().await;
        let mut driver = self.driver.lock().await;

        {
            let mut state = self.state.lock().await;
            if state.users.contains(&conn) {
                return Ok(false);
            }
            if state.exclusive.is_some() {
                return Err(Error::Locked);
            }
            if !state.users.is_empty() {
                state.users.insert(conn);
                return Ok(false);
            }
        }

        let mut opened = driver::create(&self.driver_kind, &self.driver_args)?;
        opened.open().await?;
        *driver = Some(opened);

        self.state.lock().await.users.insert(conn);
        debug!(device = %self.name, %conn, "Opened device");

        Ok(true)
    }

    /// Stop using the device, closing it if nobody else uses it.
    /// Does nothing if the connection does not use the device.
    ///
    /// Returns true if this call closed the device.
    pub async fn release(&self, conn: ConnectionId) -> Result<bool> {
        if !self.is_used_by(conn).await {
            return Ok(false);
        }

        let _serial = self.serial.lock().await;
        let mut driver = self.driver.lock().await;

        {
            let mut state = self.state.lock().await;
            if !state.users.remove(&conn) {
                return Ok(false);
            }
            state.taps.remove(&conn);
            if state.exclusive == Some(conn) {
                state.exclusive = None;
            }
            if !state.users.is_empty() {
                return Ok(false);
            }
        }

        if let Some(mut closing) = driver.take() {
            if let Err(e) = closing.close().await {
                warn!(device = %self.name, %e, "Error while closing device");
            }
        }
        debug!(device = %self.name, %conn, "Closed device");

        Ok(true)
    }

    /// Take the device for this connection only.
    /// Starts using it first if needed.
    pub async fn lock(&self, conn: ConnectionId) -> Result<()> {
        self.use_by(conn).await?;

        let mut state = self.state.lock().await;
        if state.users.len() != 1 || !state.users.contains(&conn) {
            return Err(Error::InUse);
        }
        state.exclusive = Some(conn);

        Ok(())
    }

    /// Give up exclusive use of the device.
    pub async fn unlock(&self, conn: ConnectionId) -> Result<()> {
        let mut state = self.state.lock().await;

        match state.exclusive {
            None => Err(Error::NotLocked),
            Some(holder) if holder != conn => Err(Error::LockedByOther),
            Some(_) => {
                state.exclusive = None;
                Ok(())
            }
        }
    }

    /// Send a message to the device and return the answer.
    /// Starts using the device first if needed.
    pub async fn ask(&self, conn: ConnectionId, message: &str) -> Result<String> {
        self.use_by(conn).await?;

        if matches!(self.state.lock().await.exclusive, Some(holder) if holder != conn) {
            return Err(Error::Locked);
        }

        let _serial = self.serial.lock().await;
        let mut driver = self.driver.lock().await;
        let Some(driver) = driver.as_mut() else {
            return Err(Error::Closed("device is closed".into()));
        };

        trace!(device = %self.name, %conn, %message, "Asking");
        self.record(">> ", message).await;

        // The driver may have closed itself after losing track of the conversation.
        let answer = async {
            driver.open().await?;
            driver.ask(message).await
        }
        .await;

        match answer {
            Ok(answer) => {
                trace!(device = %self.name, %answer, "Answer");
                self.record("<< ", &answer).await;
                Ok(answer)
            }
            Err(e) => {
                trace!(device = %self.name, %e, "Error");
                self.record("EE ", &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn record(&self, prefix: &'static str, text: &str) {
        let mut state = self.state.lock().await;
        if state.taps.is_empty() {
            return;
        }

        let entry = TapEntry {
            time: Local::now(),
            prefix,
            text: text.to_owned(),
        };

        for tap in state.taps.values_mut() {
            tap.push_back(entry.clone());
            while tap.len() > self.tap_capacity {
                tap.pop_front();
            }
        }
    }

    /// Start (or restart, discarding what was there) a log of traffic for this connection.
    pub async fn log_start(&self, conn: ConnectionId) {
        self.state.lock().await.taps.insert(conn, VecDeque::new());
    }

    /// Stop logging traffic for this connection.
    pub async fn log_finish(&self, conn: ConnectionId) {
        self.state.lock().await.taps.remove(&conn);
    }

    /// Take everything logged for this connection so far.
    pub async fn log_get(&self, conn: ConnectionId) -> Result<Vec<TapEntry>> {
        let mut state = self.state.lock().await;
        let tap = state.taps.get_mut(&conn).ok_or(Error::LoggingOff)?;

        Ok(tap.drain(..).collect())
    }

    /// A human readable description of the device, as seen by the given connection.
    pub async fn print(&self, conn: ConnectionId) -> String {
        let state = self.state.lock().await;
        let mut s = String::new();

        // Writing to a `String` does not fail.
        let _ = writeln!(s, "Device: {}", self.name);
        let _ = writeln!(s, "Driver: {}", self.driver_kind);
        if !self.driver_args.is_empty() {
            s.push_str("Driver arguments:\n");
            for (key, value) in self.driver_args.iter() {
                let _ = writeln!(s, "  -{key}: {value}");
            }
        }
        let _ = writeln!(
            s,
            "Device is {}",
            if state.users.is_empty() { "closed" } else { "open" }
        );
        let _ = writeln!(s, "Number of users: {}", state.users.len());
        if state.users.contains(&conn) {
            s.push_str("You are currently using the device\n");
        }
        if state.exclusive.is_some() {
            s.push_str("Device is locked\n");
        }

        s
    }

    /// Close the device and forget all users and logs.
    pub async fn shutdown(&self) {
        let _serial = self.serial.lock().await;
        let mut driver = self.driver.lock().await;

        {
            let mut state = self.state.lock().await;
            *state = DeviceState::default();
        }

        if let Some(mut closing) = driver.take() {
            debug!(device = %self.name, "Shutting down device");
            if let Err(e) = closing.close().await {
                warn!(device = %self.name, %e, "Error while closing device");
            }
        }
    }
}
