#![allow(dead_code)]

use std::{io::Write, sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use device_broker::{logging, manager::DeviceManager, server};
use hyper::{client::conn::SendRequest, Body, Request, StatusCode};
use tempfile::NamedTempFile;
use tokio::{net::TcpStream, sync::oneshot, time::timeout};
use tower::ServiceExt;
use tracing::{info, metadata::LevelFilter};

/// A running server and the device list it was started with.
pub struct TestServer {
    pub port: u16,
    pub manager: Arc<DeviceManager>,
    pub devices: NamedTempFile,
}

impl TestServer {
    /// Overwrite the device list (does not reload).
    pub fn rewrite_devices(&self, devices: &str) -> Result<()> {
        std::fs::write(self.devices.path(), devices)?;
        Ok(())
    }

    pub async fn connect(&self) -> Result<Client> {
        Client::connect(self.port).await
    }
}

pub async fn start_server(devices: &str) -> Result<TestServer> {
    logging::init(LevelFilter::INFO, None).await;

    let mut file = NamedTempFile::new()?;
    file.write_all(devices.as_bytes())?;

    let manager = Arc::new(DeviceManager::new(file.path(), 1024));
    manager.reload().await?;

    let (port_tx, port_rx) = oneshot::channel();
    let server_manager = manager.clone();
    tokio::spawn(async move { server::run_any_port(server_manager, port_tx).await });

    let port = timeout(Duration::from_secs(5), port_rx).await??;

    Ok(TestServer {
        port,
        manager,
        devices: file,
    })
}

/// What the server answered.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
    pub error_header: Option<String>,
}

/// One HTTP connection, i.e. one connection as the server sees it.
pub struct Client {
    sender: SendRequest<Body>,
}

/// Percent-encode what would otherwise change the meaning of a path.
pub fn encode(part: &str) -> String {
    let mut encoded = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            ' ' => encoded.push_str("%20"),
            '?' => encoded.push_str("%3F"),
            '#' => encoded.push_str("%23"),
            '%' => encoded.push_str("%25"),
            '/' => encoded.push_str("%2F"),
            c => encoded.push(c),
        }
    }
    encoded
}

impl Client {
    pub async fn connect(port: u16) -> Result<Self> {
        info!("Connecting to server on port {port}");
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (sender, connection) = hyper::client::conn::handshake(stream).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                info!(?e, "Client connection ended");
            }
        });

        Ok(Self { sender })
    }

    /// Request a raw path.
    pub async fn get(&mut self, path: &str) -> Result<Reply> {
        let request = Request::get(path)
            .header("host", "localhost")
            .body(Body::empty())?;

        self.sender.ready().await?;
        let response = timeout(Duration::from_secs(10), self.sender.send_request(request)).await??;

        let status = response.status();
        let error_header = response
            .headers()
            .get("error")
            .map(|v| v.to_str().map(ToOwned::to_owned))
            .transpose()?;
        let body = hyper::body::to_bytes(response.into_body()).await?;

        Ok(Reply {
            status,
            body: String::from_utf8(body.to_vec())?,
            error_header,
        })
    }

    /// Perform an action, the message may contain `/`.
    pub async fn send(&mut self, action: &str, target: &str, message: &str) -> Result<Reply> {
        let mut path = format!("/{action}");
        if !target.is_empty() || !message.is_empty() {
            path += &format!("/{}", encode(target));
        }
        if !message.is_empty() {
            let message: Vec<String> = message.split('/').map(encode).collect();
            path += &format!("/{}", message.join("/"));
        }

        self.get(&path).await
    }

    /// Perform an action which should succeed, get the answer.
    pub async fn ok(&mut self, action: &str, target: &str, message: &str) -> Result<String> {
        let reply = self.send(action, target, message).await?;

        if reply.status != StatusCode::OK {
            return Err(eyre!("{action} {target} {message}: {reply:?}"));
        }

        Ok(reply.body)
    }

    /// Perform an action which should fail, get the error message.
    pub async fn fail(&mut self, action: &str, target: &str, message: &str) -> Result<String> {
        let reply = self.send(action, target, message).await?;

        if reply.status != StatusCode::BAD_REQUEST {
            return Err(eyre!("{action} {target} {message}: {reply:?}"));
        }
        if let Some(header) = &reply.error_header {
            assert_eq!(header, &reply.body);
        }

        Ok(reply.body)
    }
}

/// Ask for `info` until it mentions `needle`, or give up after a while.
pub async fn wait_for_info(client: &mut Client, device: &str, needle: &str) -> Result<()> {
    for _ in 0..100 {
        if client.ok("info", device, "").await?.contains(needle) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Err(eyre!("`info {device}` never mentioned `{needle}`"))
}

/// A shell script on disk, to be run by an SPP device as `sh <path>`.
pub fn script(text: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(text.as_bytes())?;
    Ok(file)
}

/// A device list line for an SPP device running `script`.
pub fn spp_device(name: &str, script: &NamedTempFile) -> String {
    format!("{name} spp -prog 'sh {}'\n", script.path().display())
}
