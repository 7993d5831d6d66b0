//! Line oriented instruments on a serial port.
//!
//! Every message is sent with a newline appended.
//! An answer (one line) is only read for messages containing `?`,
//! others get an empty answer.
//!
//! Parameters:
//!
//! - `-dev`: the serial port, e.g. `/dev/ttyUSB0` or `COM3`. Required.
//! - `-baud`: default 9600.
//! - `-parity`: character size, parity and stop bits, one of `8N1` (default), `7N1`, `7E1`, `7O1`.
//! - `-sfc`: software flow control, `0` or `1` (default).
//! - `-timeout`: seconds to wait for an answer. Default 5.
//! - `-errpref`: prefix for error messages. Default `serial: `.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::{Decoder, Framed};
use tracing::{debug, trace};

use super::{Driver, Params};
use crate::error::{Error, Result};

mod codec;

use codec::LineCodec;

const PARAMETERS: [&str; 6] = ["dev", "baud", "parity", "sfc", "timeout", "errpref"];

fn framing(parity: &str) -> Option<(DataBits, Parity, StopBits)> {
    Some(match parity {
        "8N1" => (DataBits::Eight, Parity::None, StopBits::One),
        "7N1" => (DataBits::Seven, Parity::None, StopBits::One),
        "7E1" => (DataBits::Seven, Parity::Even, StopBits::One),
        "7O1" => (DataBits::Seven, Parity::Odd, StopBits::One),
        _ => return None,
    })
}

/// A serial port instrument.
pub struct SerialDriver {
    path: String,
    baud: u32,
    framing: (DataBits, Parity, StopBits),
    flow_control: FlowControl,
    timeout: Duration,
    error_prefix: String,

    /// Present while open.
    port: Option<Framed<SerialStream, LineCodec>>,
}

impl Debug for SerialDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDriver")
            .field("path", &self.path)
            .field("baud", &self.baud)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialDriver {
    /// A closed serial driver.
    pub fn new(params: &Params) -> Result<Self> {
        params.check_unknown(&PARAMETERS)?;

        let path = params.get("dev").unwrap_or_default();
        if path.is_empty() {
            return Err(Error::BadParameter(
                "Parameter -dev is empty or missing".into(),
            ));
        }

        let parity = params.get("parity").unwrap_or("8N1");
        let framing = framing(parity)
            .ok_or_else(|| Error::BadParameter(format!("unknown parity setting: {parity}")))?;

        let flow_control = match params.get_or("sfc", 1_u8)? {
            0 => FlowControl::None,
            1 => FlowControl::Software,
            other => {
                return Err(Error::BadParameter(format!(
                    "-sfc should be 0 or 1, got {other}"
                )))
            }
        };

        Ok(Self {
            path: path.to_owned(),
            baud: params.get_or("baud", 9600)?,
            framing,
            flow_control,
            timeout: params.seconds_or("timeout", 5.0)?,
            error_prefix: params.get("errpref").unwrap_or("serial: ").to_owned(),
            port: None,
        })
    }

    fn error(&self, message: impl std::fmt::Display) -> Error {
        Error::Transport(format!("{}{message}", self.error_prefix))
    }
}

#[async_trait]
impl Driver for SerialDriver {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let (data_bits, parity, stop_bits) = self.framing;
        debug!(%self.path, %self.baud, "Opening port");

        let stream = tokio_serial::new(&self.path, self.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(self.flow_control)
            .open_native_async()
            .map_err(|e| self.error(format_args!("can't open {}: {e}", self.path)))?;

        self.port = Some(LineCodec::default().framed(stream));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(%self.path, "Closed port");
        }
        Ok(())
    }

    async fn ask(&mut self, message: &str) -> Result<String> {
        self.write(message).await?;

        if !message.contains('?') {
            return Ok(String::new());
        }

        self.read().await
    }

    async fn read(&mut self) -> Result<String> {
        let Some(port) = self.port.as_mut() else {
            return Err(self.error("device is closed"));
        };

        match tokio::time::timeout(self.timeout, port.next()).await {
            Ok(Some(Ok(line))) => {
                trace!(%line, "Line from port");
                Ok(line)
            }
            Ok(Some(Err(e))) => Err(self.error(format_args!("read error: {e}"))),
            Ok(None) => Err(self.error("port closed")),
            Err(_) => Err(Error::Timeout(format!("{}read timeout", self.error_prefix))),
        }
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(self.error("device is closed"));
        };

        trace!(%message, "Line to port");
        if let Err(e) = port.send(message).await {
            return Err(self.error(format_args!("write error: {e}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().copied().collect()
    }

    #[test]
    fn defaults() {
        let driver = SerialDriver::new(&params(&[("dev", "/dev/ttyUSB0")])).unwrap();

        assert_eq!(driver.baud, 9600);
        assert_eq!(driver.flow_control, FlowControl::Software);
        assert_eq!(driver.timeout, Duration::from_secs(5));
        assert_eq!(
            driver.framing,
            (DataBits::Eight, Parity::None, StopBits::One)
        );
    }

    #[test]
    fn bad_parameters() {
        assert_eq!(
            SerialDriver::new(&Params::new()).unwrap_err(),
            Error::BadParameter("Parameter -dev is empty or missing".into())
        );
        assert_eq!(
            SerialDriver::new(&params(&[("dev", "x"), ("parity", "9X1")])).unwrap_err(),
            Error::BadParameter("unknown parity setting: 9X1".into())
        );
        assert_eq!(
            SerialDriver::new(&params(&[("dev", "x"), ("speed", "1")])).unwrap_err(),
            Error::BadParameter("unknown option: speed".into())
        );
        assert!(SerialDriver::new(&params(&[("dev", "x"), ("sfc", "2")])).is_err());
    }

    #[tokio::test]
    async fn missing_port() {
        let mut driver = SerialDriver::new(&params(&[
            ("dev", "/this/port/does/not/exist"),
            ("errpref", "psu: "),
        ]))
        .unwrap();

        let error = driver.open().await.unwrap_err().to_string();
        assert!(error.starts_with("psu: can't open /this/port/does/not/exist"));

        assert_eq!(
            driver.ask("*IDN?").await.unwrap_err(),
            Error::Transport("psu: device is closed".into())
        );
    }
}
