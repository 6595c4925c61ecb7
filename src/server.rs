//! TCP/WebSocket server.
//!
//! Accepts connections, performs the WebSocket handshake on the configured
//! base path, builds the program environment and hands the connection to a
//! session.

use crate::config::Config;
use crate::env::{self, ConnectionInfo, EnvSettings, RequestInfo};
use crate::process::ProcessSpec;
use crate::session::{self, SessionOptions};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// State shared by every connection
struct Shared {
    spec: ProcessSpec,
    options: SessionOptions,
    env: EnvSettings,
    next_session: AtomicU64,
}

/// Server instance
pub struct Server {
    config: Config,
    shared: Arc<Shared>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let shared = Shared {
            spec: config.process_spec(),
            options: config.session_options(),
            env: EnvSettings {
                base_path: config.base_path.clone(),
                passenv: config.passenv.clone(),
                extra: config.env.clone(),
            },
            next_session: AtomicU64::new(1),
        };

        Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            shared: Arc::new(shared),
        }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = bind(&self.config.listen).await?;
        info!(
            address = %listener.local_addr()?,
            base_path = %self.config.base_path,
            command = %self.config.command,
            args = ?self.config.args,
            "Server listening"
        );

        tokio::select! {
            result = self.serve(listener) => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }
        Ok(())
    }

    /// Accept connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let shared = Arc::clone(&self.shared);
                    let base_path = self.config.base_path.clone();

                    tokio::spawn(async move {
                        handle_connection(stream, addr, &base_path, shared).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Create a non-blocking listener with SO_REUSEADDR.
async fn bind(listen: &str) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(listen)
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {listen}"),
            )
        })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Does a request for `path` belong to the endpoint at `base_path`?
///
/// A base path ending in `/` matches everything below it; otherwise the
/// match is exact.
fn path_matches(base_path: &str, path: &str) -> bool {
    if base_path.ends_with('/') {
        path.starts_with(base_path)
    } else {
        path == base_path
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    base_path: &str,
    shared: Arc<Shared>,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection lost before handshake");
            return;
        }
    };

    let mut request = None;
    let callback = |req: &Request, response: Response| {
        if !path_matches(base_path, req.uri().path()) {
            debug!(peer = %peer, path = %req.uri().path(), "No endpoint for path");
            return Err(not_found());
        }
        request = Some(RequestInfo::from_request(req));
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(request) = request else {
        return;
    };

    let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    info!(session = session_id, peer = %peer, path = %request.path, "websocket: CONNECT");

    let conn = ConnectionInfo {
        session_id,
        remote: peer,
        local,
    };
    let env = env::build_env(&shared.env, &conn, &request, |name| std::env::var(name).ok());

    // Launch failures and relay errors are logged by the session itself.
    match session::run_session(session_id, ws, &shared.spec, &env, &shared.options).await {
        Ok(report) => info!(
            session = session_id,
            peer = %peer,
            first = ?report.first_finished,
            exit = ?report.exit_status,
            "websocket: DISCONNECT"
        ),
        Err(_) => info!(session = session_id, peer = %peer, "websocket: DISCONNECT"),
    }
}
