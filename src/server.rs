use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::Path,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use hyper::server::conn::Http;
use tokio::{net::TcpListener, sync::oneshot};
use tower::ServiceBuilder;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    connection::{ConnectionCounter, ConnectionId},
    error::{Error, Result},
    manager::DeviceManager,
};

/// Failed requests carry the error message in this header too.
pub const ERROR_HEADER: &str = "error";

fn router(manager: Arc<DeviceManager>) -> Router {
    Router::new()
        .route("/:action", get(handle))
        .route("/:action/:target", get(handle))
        .route("/:action/:target/*message", get(handle))
        .layer(Extension(manager))
}

async fn handle(
    Extension(conn): Extension<ConnectionId>,
    Extension(manager): Extension<Arc<DeviceManager>>,
    Path(parts): Path<HashMap<String, String>>,
) -> Response {
    let part = |key: &str| parts.get(key).map(String::as_str).unwrap_or_default();

    let action = part("action");
    let target = part("target");
    let message = part("message");
    let message = message.strip_prefix('/').unwrap_or(message);

    debug!(%conn, %action, %target, %message, "Request");

    match manager.dispatch(action, target, message, conn).await {
        Ok(answer) => (StatusCode::OK, answer).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: Error) -> Response {
    let text = e.to_string();
    let header = HeaderValue::from_str(&text).ok();

    let mut response = (StatusCode::BAD_REQUEST, text).into_response();
    if let Some(header) = header {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_HEADER), header);
    }

    response
}

async fn run(
    manager: Arc<DeviceManager>,
    addr: SocketAddr,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(format!("can't listen on {addr}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Transport(format!("no local address: {e}")))?;

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody listened for the allocated port");
        }
    }

    info!("listening on {}", addr);

    let app = router(manager.clone());
    let connections = ConnectionCounter::default();

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(?e, "Accept failed");
                continue;
            }
        };

        let conn = connections.next();
        let manager = manager.clone();

        // Every request on this connection knows which connection it came from.
        let service = ServiceBuilder::new()
            .layer(Extension(conn))
            .service(app.clone());

        tokio::spawn(
            async move {
                manager.conn_open(conn).await;

                if let Err(e) = Http::new().serve_connection(stream, service).await {
                    debug!(?e, "Connection ended with error");
                }

                manager.conn_close(conn).await;
            }
            .instrument(debug_span!("conn", %conn, %peer)),
        );
    }
}

/// Start the server on an arbitrary available port on localhost.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    manager: Arc<DeviceManager>,
    allocated_port: oneshot::Sender<u16>,
) -> Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    run(manager, addr, Some(allocated_port)).await
}

/// Start the server on the given address and port.
pub async fn run_on_port(manager: Arc<DeviceManager>, address: IpAddr, port: u16) -> Result<()> {
    run(manager, SocketAddr::new(address, port), None).await
}
