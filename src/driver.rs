//! Drivers know how to talk to one kind of device.
//!
//! A driver is created from the flat parameter list of its configuration line,
//! see [`create`].

use std::{collections::BTreeMap, fmt::Debug, str::FromStr, time::Duration};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Drivers for serial line instruments.
pub mod serial;

/// The Simple Pipe Protocol driver.
pub mod spp;


/// The driver names accepted in configuration files.
pub const KINDS: [&str; 3] = ["test", "spp", "serial"];

/// True if a driver with this name exists.
pub fn is_known(kind: &str) -> bool {
    KINDS.contains(&kind)
}

/// Create a closed driver of the given kind.
pub fn create(kind: &str, params: &Params) -> Result<Box<dyn Driver>> {
    let driver: Box<dyn Driver> = match kind {
        "test" => Box::new(test::TestDriver::new(params)?),
        "spp" => Box::new(spp::SppDriver::new(params)?),
        "serial" => Box::new(serial::SerialDriver::new(params)?),
        _ => return Err(Error::UnknownDriver(kind.to_owned())),
    };

    Ok(driver)
}

/// Something which can get messages to and from a device.
///
/// The owner serializes all calls,
/// and only calls [`Driver::ask`] between [`Driver::open`] and [`Driver::close`].
#[async_trait]
pub trait Driver: Send + Debug {
    /// Open the device.
    async fn open(&mut self) -> Result<()>;

    /// Close the device. Closing a closed device does nothing.
    async fn close(&mut self) -> Result<()>;

    /// Send a message, return the answer.
    async fn ask(&mut self, message: &str) -> Result<String>;

    /// Read a message without sending anything.
    async fn read(&mut self) -> Result<String> {
        Err(Error::BadUsage(
            "this driver does not support reading without asking".into(),
        ))
    }

    /// Send a message without waiting for an answer.
    async fn write(&mut self, _message: &str) -> Result<()> {
        Err(Error::BadUsage(
            "this driver does not support writing without asking".into(),
        ))
    }
}

/// Driver parameters, as given on a configuration line.
///
/// Keys are stored without the leading `-`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    /// No parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// The raw value of a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The parameter parsed as `T`, or `default` if missing.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| Error::BadParameter(format!("can't parse value: \"{value}\""))),
        }
    }

    /// A timeout given in (possibly fractional) seconds, or `default` if missing.
    pub fn seconds_or(&self, key: &str, default: f64) -> Result<Duration> {
        let seconds: f64 = self.get_or(key, default)?;

        Duration::try_from_secs_f64(seconds).map_err(|_| {
            Error::BadParameter(format!(
                "timeout should be a non-negative number of seconds: -{key} {seconds}"
            ))
        })
    }

    /// Fail if any parameter is not in `known`.
    pub fn check_unknown(&self, known: &[&str]) -> Result<()> {
        let unknown: Vec<&str> = self
            .0
            .keys()
            .map(String::as_str)
            .filter(|key| !known.contains(key))
            .collect();

        match unknown.len() {
            0 => Ok(()),
            1 => Err(Error::BadParameter(format!("unknown option: {}", unknown[0]))),
            _ => Err(Error::BadParameter(format!(
                "unknown options: {}",
                unknown.join(", ")
            ))),
        }
    }

    /// Iterate over `(key, value)` pairs, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
