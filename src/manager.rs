//! All configured devices, and the connections using them.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use futures::future::join_all;
use itertools::Itertools;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, debug_span, info, Instrument};

use crate::{
    actions::Action,
    config::{devices::read_devices, Settings},
    connection::ConnectionId,
    device::Device,
    error::{Error, Result},
    named_lock::NamedLocks,
};

/// Owns the devices, and routes actions to them.
#[derive(Debug)]
pub struct DeviceManager {
    conf_file: PathBuf,
    tap_capacity: usize,

    /// One lock per device name, outliving reloads.
    locks: NamedLocks,

    devices: RwLock<BTreeMap<String, Arc<Device>>>,

    /// Open connections and their names.
    connections: Mutex<BTreeMap<ConnectionId, String>>,
}

impl DeviceManager {
    /// A manager without devices.
    /// `conf_file` is read on [`DeviceManager::reload`].
    pub fn new(conf_file: impl Into<PathBuf>, tap_capacity: usize) -> Self {
        Self {
            conf_file: conf_file.into(),
            tap_capacity,
            locks: NamedLocks::new(),
            devices: RwLock::default(),
            connections: Mutex::default(),
        }
    }

    /// A manager set up and loaded as the settings say.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let manager = Self::new(&settings.devices, settings.log_tap_capacity);
        manager.reload().await?;

        Ok(manager)
    }

    /// Replace all devices by the ones in the given file.
    ///
    /// Nothing changes if the file can not be read or has any error.
    /// Devices which are replaced are closed.
    pub async fn read_conf(&self, path: &Path) -> Result<()> {
        info!(?path, "Reading configuration file");
        let entries = read_devices(path).await?;

        let devices: BTreeMap<_, _> = entries
            .into_iter()
            .map(|entry| {
                let serial = self.locks.acquire(&entry.name);
                let name = entry.name.clone();
                (name, Arc::new(Device::new(entry, serial, self.tap_capacity)))
            })
            .collect();
        info!("{} devices configured", devices.len());

        let old = std::mem::replace(&mut *self.devices.write().await, devices);

        join_all(old.values().map(|device| device.shutdown())).await;

        Ok(())
    }

    /// Read the configuration file again.
    pub async fn reload(&self) -> Result<()> {
        self.read_conf(&self.conf_file).await
    }

    /// The names of all devices, sorted.
    pub async fn device_names(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    async fn device(&self, name: &str) -> Result<Arc<Device>> {
        if name.is_empty() {
            return Err(Error::BadUsage("empty device".into()));
        }

        self.devices
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchDevice(name.to_owned()))
    }

    async fn all_devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// A connection was opened.
    pub async fn conn_open(&self, conn: ConnectionId) {
        debug!(%conn, "Connection opened");
        self.connections
            .lock()
            .await
            .insert(conn, conn.default_name());
    }

    /// A connection was closed.
    /// Releases everything it used and forgets its name.
    pub async fn conn_close(&self, conn: ConnectionId) {
        debug!(%conn, "Connection closed");

        for device in self.all_devices().await {
            device.log_finish(conn).await;
        }
        self.release_all(conn).await;

        self.connections.lock().await.remove(&conn);
    }

    /// Release every device the connection uses.
    pub async fn release_all(&self, conn: ConnectionId) {
        for device in self.all_devices().await {
            match device.release(conn).await {
                Ok(true) => debug!(device = %device.name(), "Closed"),
                Ok(false) => {}
                Err(e) => debug!(device = %device.name(), %e, "Release failed"),
            }
        }
    }

    /// Name a connection.
    /// Names have no whitespace and are unique among open connections.
    pub async fn set_conn_name(&self, conn: ConnectionId, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::BadUsage(format!("bad connection name: \"{name}\"")));
        }

        let mut connections = self.connections.lock().await;

        if connections
            .iter()
            .any(|(other, other_name)| *other != conn && other_name == name)
        {
            return Err(Error::NameTaken(name.to_owned()));
        }

        connections.insert(conn, name.to_owned());
        Ok(())
    }

    /// The name of a connection.
    pub async fn conn_name(&self, conn: ConnectionId) -> String {
        self.connections
            .lock()
            .await
            .get(&conn)
            .cloned()
            .unwrap_or_else(|| conn.default_name())
    }

    /// Names of all open connections, in the order they were opened.
    pub async fn conn_names(&self) -> Vec<String> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Perform an action for a connection.
    ///
    /// `target` is the device for device actions, and the argument for others.
    /// `message` is what to send for [`Action::Ask`].
    pub async fn dispatch(
        &self,
        action: &str,
        target: &str,
        message: &str,
        conn: ConnectionId,
    ) -> Result<String> {
        let action: Action = action.parse()?;

        let span = debug_span!("action", %action, %conn, %target);
        let result = self.run(action, target, message, conn).instrument(span).await;

        if let Err(e) = &result {
            debug!(%conn, %action, %target, %e, "Action failed");
        }

        result
    }

    async fn run(
        &self,
        action: Action,
        target: &str,
        message: &str,
        conn: ConnectionId,
    ) -> Result<String> {
        if action.targets_device() {
            let device = self.device(target).await?;

            return match action {
                Action::Ask => device.ask(conn, message).await,
                Action::Use => device.use_by(conn).await.map(|_| String::new()),
                Action::Release => device.release(conn).await.map(|_| String::new()),
                Action::Lock => device.lock(conn).await.map(|()| String::new()),
                Action::Unlock => device.unlock(conn).await.map(|()| String::new()),
                Action::LogStart => {
                    device.log_start(conn).await;
                    Ok(String::new())
                }
                Action::LogFinish => {
                    device.log_finish(conn).await;
                    Ok(String::new())
                }
                Action::LogGet => Ok(device
                    .log_get(conn)
                    .await?
                    .into_iter()
                    .map(|entry| format!("{entry}\n"))
                    .collect()),
                Action::Info => Ok(device.print(conn).await),
                _ => Err(Error::UnknownAction(action.to_string())),
            };
        }

        match action {
            Action::Ping => Ok(String::new()),
            Action::GetTime => {
                let now = Utc::now();
                Ok(format!(
                    "{}.{:06}",
                    now.timestamp(),
                    now.timestamp_subsec_micros()
                ))
            }
            Action::Devices => Ok(lines(self.device_names().await)),
            Action::Reload => self.reload().await.map(|()| String::new()),
            Action::SetConnName => self.set_conn_name(conn, target).await.map(|()| String::new()),
            Action::GetConnName => Ok(self.conn_name(conn).await),
            Action::ListConnNames => Ok(lines(self.conn_names().await)),
            Action::ReleaseAll => {
                self.release_all(conn).await;
                Ok(String::new())
            }
            _ => Err(Error::UnknownAction(action.to_string())),
        }
    }
}

fn lines(items: Vec<String>) -> String {
    items.iter().map(|item| format!("{item}\n")).join("")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn conf(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    async fn manager(file: &NamedTempFile) -> DeviceManager {
        let manager = DeviceManager::new(file.path(), 1024);
        manager.reload().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn end_to_end() {
        let file = conf("dut test\n");
        let m = manager(&file).await;

        assert_eq!(m.dispatch("use", "dut", "", ConnectionId(5)).await.unwrap(), "");
        assert_eq!(
            m.dispatch("ask", "dut", "ping", ConnectionId(5)).await.unwrap(),
            "ping"
        );
        m.dispatch("release", "dut", "", ConnectionId(5)).await.unwrap();
        assert_eq!(
            m.dispatch("ask", "dut", "ping", ConnectionId(5)).await.unwrap(),
            "ping"
        );
    }

    #[tokio::test]
    async fn bad_requests() {
        let file = conf("dut test\n");
        let m = manager(&file).await;

        assert_eq!(
            m.dispatch("open", "dut", "", A).await.unwrap_err(),
            Error::UnknownAction("open".into())
        );
        assert_eq!(
            m.dispatch("ask", "", "x", A).await.unwrap_err(),
            Error::BadUsage("empty device".into())
        );
        assert_eq!(
            m.dispatch("ask", "nope", "x", A).await.unwrap_err(),
            Error::NoSuchDevice("nope".into())
        );
    }

    #[tokio::test]
    async fn server_actions() {
        let file = conf("b test\na test\n");
        let m = manager(&file).await;

        assert_eq!(m.dispatch("ping", "", "", A).await.unwrap(), "");
        assert_eq!(m.dispatch("list", "", "", A).await.unwrap(), "a\nb\n");
        assert_eq!(m.dispatch("devices", "", "", A).await.unwrap(), "a\nb\n");

        let time = m.dispatch("get_time", "", "", A).await.unwrap();
        let (secs, micros) = time.split_once('.').unwrap();
        assert!(secs.parse::<i64>().unwrap() > 1_600_000_000);
        assert_eq!(micros.len(), 6);
    }

    #[tokio::test]
    async fn failed_reload_changes_nothing() {
        let mut file = conf("a test\nb test\n");
        let m = manager(&file).await;

        m.dispatch("use", "a", "", A).await.unwrap();

        file.write_all(b"c test\na test\n").unwrap();
        let err = m.reload().await.unwrap_err().try_into_bad_config().unwrap();
        assert!(err.ends_with("at line 4: duplicated device name: a"), "{err}");

        assert_eq!(m.device_names().await, ["a", "b"]);
        assert!(m.device("a").await.unwrap().is_used_by(A).await);
    }

    #[tokio::test]
    async fn reload_replaces_devices() {
        let file = conf("a test\n");
        let m = manager(&file).await;

        m.dispatch("lock", "a", "", A).await.unwrap();
        let old = m.device("a").await.unwrap();

        std::fs::write(file.path(), "a test\nb test\n").unwrap();
        assert_eq!(m.dispatch("reload", "", "", A).await.unwrap(), "");

        assert_eq!(m.device_names().await, ["a", "b"]);
        assert!(!old.is_open().await);

        // The new device is not locked.
        m.dispatch("ask", "a", "x", B).await.unwrap();
    }

    #[tokio::test]
    async fn closing_connection_releases_devices() {
        let file = conf("a test\nb test\n");
        let m = manager(&file).await;
        m.conn_open(A).await;
        m.conn_open(B).await;

        m.dispatch("lock", "a", "", A).await.unwrap();
        m.dispatch("use", "b", "", A).await.unwrap();
        m.dispatch("log_start", "b", "", A).await.unwrap();
        m.dispatch("use", "b", "", B).await.unwrap();

        m.conn_close(A).await;

        assert!(!m.device("a").await.unwrap().is_open().await);
        assert!(m.device("b").await.unwrap().is_open().await);
        assert_eq!(
            m.dispatch("log_get", "b", "", A).await.unwrap_err(),
            Error::LoggingOff
        );
        m.dispatch("lock", "a", "", B).await.unwrap();
        assert_eq!(m.conn_names().await, ["conn:2"]);
    }

    #[tokio::test]
    async fn closing_connection_drops_taps_on_unused_devices() {
        let file = conf("a test\n");
        let m = manager(&file).await;

        m.dispatch("log_start", "a", "", A).await.unwrap();
        m.conn_close(A).await;

        assert_eq!(
            m.dispatch("log_get", "a", "", A).await.unwrap_err(),
            Error::LoggingOff
        );
    }

    #[tokio::test]
    async fn release_all_keeps_the_name() {
        let file = conf("a test\nb test\n");
        let m = manager(&file).await;
        m.conn_open(A).await;
        m.set_conn_name(A, "alice").await.unwrap();

        m.dispatch("use", "a", "", A).await.unwrap();
        m.dispatch("use", "b", "", A).await.unwrap();
        m.dispatch("release_all", "", "", A).await.unwrap();

        assert!(!m.device("a").await.unwrap().is_open().await);
        assert!(!m.device("b").await.unwrap().is_open().await);
        assert_eq!(m.dispatch("get_conn_name", "", "", A).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn connection_names() {
        let file = conf("");
        let m = manager(&file).await;
        m.conn_open(A).await;
        m.conn_open(B).await;

        assert_eq!(m.dispatch("get_conn_name", "", "", A).await.unwrap(), "conn:1");

        m.dispatch("set_conn_name", "alice", "", A).await.unwrap();
        assert_eq!(
            m.dispatch("set_conn_name", "alice", "", B).await.unwrap_err(),
            Error::NameTaken("alice".into())
        );
        // Setting your own name again is fine.
        m.dispatch("set_conn_name", "alice", "", A).await.unwrap();
        assert!(matches!(
            m.dispatch("set_conn_name", "", "", B).await,
            Err(Error::BadUsage(_))
        ));

        assert_eq!(
            m.dispatch("list_conn_names", "", "", A).await.unwrap(),
            "alice\nconn:2\n"
        );

        m.conn_close(A).await;
        m.dispatch("set_conn_name", "alice", "", B).await.unwrap();
    }

    #[tokio::test]
    async fn log_get_format() {
        let file = conf("a test\n");
        let m = manager(&file).await;

        m.dispatch("log_start", "a", "", A).await.unwrap();
        m.dispatch("ask", "a", "hi", A).await.unwrap();

        let log = m.dispatch("log_get", "a", "", A).await.unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);

        // "YYYY-MM-DD HH:MM:SS.mmm >> hi"
        assert_eq!(lines[0].len(), 23 + " >> hi".len());
        assert!(lines[0].ends_with(" >> hi"));
        assert!(lines[1].ends_with(" << hi"));
        assert!(log.ends_with('\n'));
    }
}
