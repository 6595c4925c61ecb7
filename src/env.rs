//! CGI-style environment for spawned programs.
//!
//! Built once per connection from the handshake request and socket addresses.
//! The result is an ordered `KEY=VALUE` list; the launcher applies it verbatim
//! so later entries override earlier ones.

use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::handshake::server::Request;

const GATEWAY_INTERFACE: &str = "wsexec-CGI/0.1";

/// The parts of the upgrade request the environment needs.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub path: String,
    pub query: Option<String>,
    /// Header name/value pairs in arrival order, repeated names joined with `, `.
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn from_request(request: &Request) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        for (name, value) in request.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            match headers.iter_mut().find(|(n, _)| n == name.as_str()) {
                Some((_, joined)) => {
                    joined.push_str(", ");
                    joined.push_str(&value);
                }
                None => headers.push((name.as_str().to_string(), value.into_owned())),
            }
        }

        Self {
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            headers,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path plus query, as sent by the client.
    fn request_uri(&self) -> String {
        match self.query {
            Some(ref query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// Socket-level facts about one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub session_id: u64,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// Server-wide environment settings.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    /// Base path the endpoint is mounted on
    pub base_path: String,
    /// Parent variables copied through when set
    pub passenv: Vec<String>,
    /// Extra `KEY=VALUE` entries appended last
    pub extra: Vec<String>,
}

/// Build the environment for one session.
///
/// `parent` looks up variables in the server's own environment.
pub fn build_env<F>(
    settings: &EnvSettings,
    conn: &ConnectionInfo,
    request: &RequestInfo,
    parent: F,
) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = Vec::with_capacity(24 + settings.passenv.len() + request.headers.len());
    let mut push = |key: &str, value: &str| env.push(format!("{key}={value}"));

    push(
        "SERVER_SOFTWARE",
        concat!("wsexec/", env!("CARGO_PKG_VERSION")),
    );

    for name in &settings.passenv {
        if let Some(value) = parent(name) {
            push(name, &value);
        }
    }

    let (server_name, server_port) = server_host_port(request.header("host"), conn.local);
    let remote_ip = conn.remote.ip().to_string();
    let path_info = path_info(&settings.base_path, &request.path);

    push("REMOTE_ADDR", &remote_ip);
    push("REMOTE_HOST", &remote_ip);
    push("REMOTE_PORT", &conn.remote.port().to_string());
    push("SERVER_NAME", &server_name);
    push("SERVER_PORT", &server_port);
    push("SERVER_PROTOCOL", "HTTP/1.1");
    push("GATEWAY_INTERFACE", GATEWAY_INTERFACE);
    push("REQUEST_METHOD", "GET");
    push("SCRIPT_NAME", &settings.base_path);
    push("PATH_INFO", path_info);
    push("PATH_TRANSLATED", &request.path);
    push("QUERY_STRING", request.query.as_deref().unwrap_or(""));
    push("REQUEST_URI", &request.request_uri());
    push("UNIQUE_ID", &conn.session_id.to_string());

    // Not supported; set empty so nothing leaks in from elsewhere.
    for key in [
        "AUTH_TYPE",
        "CONTENT_LENGTH",
        "CONTENT_TYPE",
        "REMOTE_IDENT",
        "REMOTE_USER",
    ] {
        push(key, "");
    }

    for (name, value) in &request.headers {
        push(&header_env_name(name), value);
    }

    env.extend(settings.extra.iter().cloned());
    env
}

/// `User-Agent` → `HTTP_USER_AGENT`
fn header_env_name(name: &str) -> String {
    let mut key = String::with_capacity(5 + name.len());
    key.push_str("HTTP_");
    key.extend(name.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// Request path below the base path.
fn path_info<'a>(base_path: &str, path: &'a str) -> &'a str {
    path.strip_prefix(base_path.trim_end_matches('/'))
        .unwrap_or(path)
}

/// Server name and port from the Host header, falling back to the local address.
fn server_host_port(host: Option<&str>, local: SocketAddr) -> (String, String) {
    let Some(host) = host.filter(|h| !h.is_empty()) else {
        return (local.ip().to_string(), local.port().to_string());
    };

    // [v6addr]:port
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((name, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').unwrap_or("80");
            return (name.to_string(), port.to_string());
        }
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name.to_string(), port.to_string()),
        _ => (host.to_string(), "80".to_string()),
    }
}
