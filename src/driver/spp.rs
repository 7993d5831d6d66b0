//! Programs speaking the Simple Pipe Protocol.
//!
//! The program is run with its stdin and stdout connected to us.
//! Its first line is a header, `<c>SPP<version>`, where `<c>` is any character
//! (usually `#`) which from then on marks control lines.
//! Every answer (including the unasked one following the header) ends with
//! `<c>OK`, or with `<c>Error: <message>` / `<c>Fatal: <message>`.
//! Data lines starting with `<c>` are protected by doubling it.
//!
//! Parameters:
//!
//! - `-prog`: the command to run. Required.
//! - `-open_timeout`: seconds to wait for the header and first answer. Default 20.
//! - `-read_timeout`: seconds to wait for each line of an answer. Default 5.
//! - `-close_timeout`: seconds the program gets to exit after its input is closed,
//!   before it is aborted. Default 5.
//! - `-idn`: answer `*idn?` with this instead of asking the program.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::{Driver, Params};
use crate::{
    bridge::PipeBridge,
    error::{Error, ErrorKind, Result},
};

/// A Simple Pipe Protocol session.
#[derive(Debug)]
pub struct SppDriver {
    prog: String,
    open_timeout: Duration,
    read_timeout: Duration,
    close_timeout: Duration,
    idn: Option<String>,

    /// Present while open.
    bridge: Option<PipeBridge>,

    /// The control character announced by the header.
    escape: char,
}

impl SppDriver {
    /// A closed session for the program given by `-prog`.
    pub fn new(params: &Params) -> Result<Self> {
        let prog = params.get("prog").unwrap_or_default();
        if prog.is_empty() {
            return Err(Error::BadParameter(
                "Parameter -prog is empty or missing".into(),
            ));
        }

        Ok(Self {
            prog: prog.to_owned(),
            open_timeout: params.seconds_or("open_timeout", 20.0)?,
            read_timeout: params.seconds_or("read_timeout", 5.0)?,
            close_timeout: params.seconds_or("close_timeout", 5.0)?,
            idn: params.get("idn").map(ToOwned::to_owned),
            bridge: None,
            escape: '#',
        })
    }

    fn closed(&self) -> Error {
        Error::Closed("SPP: device is closed".into())
    }

    fn check_header(&mut self, header: Option<String>) -> Result<()> {
        let header = header.unwrap_or_default();
        let chars: Vec<char> = header.chars().collect();

        if chars.len() < 5 || chars[1..4] != ['S', 'P', 'P'] {
            return Err(Error::Protocol(format!(
                "SPP: unknown protocol, header expected: {}",
                self.prog
            )));
        }

        let version: String = chars[4..].iter().collect();
        let version: i32 = version
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("can't parse value: \"{version}\"")))?;

        if version != 1 && version != 2 {
            return Err(Error::Protocol(format!(
                "SPP: unsupported protocol version: {}",
                self.prog
            )));
        }

        self.escape = chars[0];
        debug!(prog = %self.prog, %version, escape = %self.escape, "SPP header");

        Ok(())
    }

    /// Read lines until the end of an answer, returning the body.
    async fn read_answer(&mut self, timeout: Duration) -> Result<String> {
        let escape = self.escape;
        let bridge = match self.bridge.as_mut() {
            Some(bridge) => bridge,
            None => return Err(self.closed()),
        };

        let mut body: Vec<String> = vec![];

        while let Some(line) = bridge.read_line(timeout).await? {
            trace!(%line, "SPP line");

            let Some(control) = line.strip_prefix(escape) else {
                body.push(line);
                continue;
            };

            if control == "OK" {
                return Ok(body.join("\n"));
            } else if let Some(message) = control.strip_prefix("Error: ") {
                return Err(Error::DeviceError(message.to_owned()));
            } else if let Some(message) = control.strip_prefix("Fatal: ") {
                return Err(Error::DeviceFatal(message.to_owned()));
            } else if control.starts_with(escape) {
                body.push(control.to_owned());
            } else {
                return Err(Error::Protocol(format!(
                    "SPP: symbol {escape} in the beginning of a line is not protected: {}",
                    self.prog
                )));
            }
        }

        Err(Error::Protocol(format!(
            "SPP: no {escape}OK or {escape}Error message: {}",
            self.prog
        )))
    }

    async fn handshake(&mut self) -> Result<()> {
        let header = match self.bridge.as_mut() {
            Some(bridge) => bridge.read_line(self.open_timeout).await?,
            None => return Err(self.closed()),
        };
        self.check_header(header)?;

        let greeting = self.read_answer(self.open_timeout).await?;
        trace!(%greeting, "Discarding SPP greeting");

        Ok(())
    }

    /// Close the session if the program broke the protocol, or if its answer is late.
    /// A late answer would otherwise be taken as the answer to the next message.
    async fn close_if_out_of_step<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Protocol || matches!(e, Error::Timeout(_)) {
                warn!(prog = %self.prog, %e, "Closing SPP session");
                if let Err(e) = self.close().await {
                    warn!(%e, "Closing SPP session");
                }
            }
        }

        result
    }
}

#[async_trait]
impl Driver for SppDriver {
    async fn open(&mut self) -> Result<()> {
        if self.bridge.is_some() {
            return Ok(());
        }

        self.bridge = Some(PipeBridge::spawn(&self.prog)?);

        if let Err(e) = self.handshake().await {
            if let Err(close_error) = self.close().await {
                warn!(%close_error, "Closing SPP program after failed open");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut bridge) = self.bridge.take() else {
            return Ok(());
        };

        bridge.close_input().await;
        bridge.watchdog_start(self.close_timeout);
        let status = bridge.finish().await?;

        debug!(prog = %self.prog, %status, "SPP program ended");
        Ok(())
    }

    async fn ask(&mut self, message: &str) -> Result<String> {
        if self.bridge.is_none() {
            return Err(self.closed());
        }

        if let Some(idn) = &self.idn {
            if message.trim().eq_ignore_ascii_case("*idn?") {
                return Ok(idn.clone());
            }
        }

        self.write(message).await?;
        self.read().await
    }

    /// Read one answer. On a protocol error or a timeout the session is closed,
    /// [`Driver::open`] starts a new one.
    async fn read(&mut self) -> Result<String> {
        let answer = self.read_answer(self.read_timeout).await;
        self.close_if_out_of_step(answer).await
    }

    async fn write(&mut self, message: &str) -> Result<()> {
        let bridge = match self.bridge.as_mut() {
            Some(bridge) => bridge,
            None => return Err(self.closed()),
        };

        bridge.write(format!("{message}\n").as_bytes()).await?;
        bridge.flush().await
    }
}
