use crate::analyzer::Analyzer;
use crate::config::KioskConfig;
use crate::error::AnalysisError;
use crate::frame::{DetectionContext, Frame};
use crate::report::present;
use crate::storage::{validate_session_id, ProfileStore, SqliteProfileStore};
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
    /// Largest accepted request body; bigger requests get 413.
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8791".to_string(),
            token_path: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ApiConfig {
    pub fn from_kiosk(cfg: &KioskConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            token_path: cfg.api_token_path.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Bearer capability token, generated once per server start.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        // Fold every byte so the comparison time does not depend on the prefix.
        let diff = presented
            .iter()
            .zip(self.token.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

/// Body of `POST /analyze`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalyzeRequest {
    #[serde(default)]
    session_id: Option<String>,
    width: u32,
    height: u32,
    /// Tightly packed RGB24, hex encoded.
    pixels_hex: String,
    #[serde(default)]
    context: DetectionContext,
}

pub struct ApiServer {
    cfg: ApiConfig,
    kiosk_cfg: KioskConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, kiosk_cfg: KioskConfig) -> Self {
        Self { cfg, kiosk_cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        // Fail before binding: a server must never answer with invalid thresholds.
        let analyzer = Analyzer::new(self.kiosk_cfg.analyzer.clone())?;
        let store = SqliteProfileStore::open(&self.kiosk_cfg.db_path)?;

        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let token_path = cfg.token_path.clone();
        let mut state = ServerState {
            analyzer,
            store: Box::new(store),
            capability,
            max_body_bytes: cfg.max_body_bytes,
        };
        let join = std::thread::Builder::new()
            .name("kiosk-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &mut state, shutdown_thread) {
                    log::error!("kiosk api stopped: {}", err);
                }
            })?;
        log::info!("kiosk api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

struct ServerState {
    analyzer: Analyzer,
    store: Box<dyn ProfileStore>,
    capability: CapabilityToken,
    max_body_bytes: usize,
}

fn run_api(
    listener: TcpListener,
    state: &mut ServerState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, state) {
                    log::warn!("kiosk api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

enum Route {
    Health,
    Analyze,
    SessionProfile(String),
}

fn route(method: &str, path: &str) -> std::result::Result<Route, u16> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (route, allowed) = match segments.as_slice() {
        ["health"] => (Route::Health, "GET"),
        ["analyze"] => (Route::Analyze, "POST"),
        ["sessions", id, "profile"] => (Route::SessionProfile((*id).to_string()), "GET"),
        _ => return Err(404),
    };
    if method != allowed {
        return Err(405);
    }
    Ok(route)
}

fn handle_connection(mut stream: TcpStream, state: &mut ServerState) -> Result<()> {
    // Accepted sockets can inherit the listener's non-blocking flag.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let mut request = read_request(&mut stream)?;
    let route = match route(&request.method, &request.path) {
        Ok(route) => route,
        Err(404) => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
        Err(_) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
            return Ok(());
        }
    };

    if let Route::Health = route {
        write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        return Ok(());
    }

    if request.has_query_token() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }
    let token = match request.bearer_token() {
        Some(token) => token,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if let Err(err) = state.capability.validate(&token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    match route {
        Route::Health => Ok(()),
        Route::Analyze => {
            let length = request.content_length()?;
            if length > state.max_body_bytes {
                write_json_response(&mut stream, 413, r#"{"error":"body_too_large"}"#)?;
                return Ok(());
            }
            read_body(&mut stream, &mut request, length)?;
            handle_analyze(&mut stream, state, &request.body)
        }
        Route::SessionProfile(session_id) => {
            if validate_session_id(&session_id).is_err() {
                write_json_response(&mut stream, 400, r#"{"error":"invalid_session"}"#)?;
                return Ok(());
            }
            match state.store.latest_profile(&session_id)? {
                Some(stored) => {
                    let payload = serde_json::to_vec(&stored)?;
                    write_response(&mut stream, 200, "application/json", &payload)
                }
                None => write_json_response(&mut stream, 404, r#"{"error":"no_profile"}"#),
            }
        }
    }
}

fn handle_analyze(stream: &mut TcpStream, state: &mut ServerState, body: &[u8]) -> Result<()> {
    let req: AnalyzeRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(err) => return write_error(stream, 400, "invalid_request", &err.to_string()),
    };
    if let Some(session_id) = &req.session_id {
        if validate_session_id(session_id).is_err() {
            return write_error(stream, 400, "invalid_session", "unsupported session id");
        }
    }
    let pixels = match hex::decode(req.pixels_hex.trim()) {
        Ok(pixels) => pixels,
        Err(err) => return write_error(stream, 400, "invalid_request", &err.to_string()),
    };
    let analyzed = Frame::from_rgb(req.width, req.height, pixels)
        .and_then(|frame| state.analyzer.analyze(&frame, &req.context));
    let profile = match analyzed {
        Ok(profile) => present(profile),
        Err(AnalysisError::InvalidInput(msg)) => {
            return write_error(stream, 400, "invalid_input", &msg)
        }
        Err(err @ AnalysisError::Config(_)) => {
            write_error(stream, 500, "analysis_failed", &err.to_string())?;
            return Err(err.into());
        }
    };
    if let Some(session_id) = &req.session_id {
        state.store.record_profile(session_id, &profile)?;
    }
    let payload = serde_json::to_vec(&profile)?;
    write_response(stream, 200, "application/json", &payload)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body: data[header_end + 4..].to_vec(),
    })
}

fn read_body(stream: &mut TcpStream, request: &mut HttpRequest, length: usize) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut buf = [0u8; 16 * 1024];
    while request.body.len() < length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!(
                "body truncated: {} of {} bytes",
                request.body.len(),
                length
            ));
        }
        request.body.extend_from_slice(&buf[..n]);
    }
    request.body.truncate(length);
    Ok(())
}

fn write_error(stream: &mut TcpStream, status: u16, error: &str, detail: &str) -> Result<()> {
    let body = serde_json::json!({ "error": error, "detail": detail });
    write_response(stream, status, "application/json", &serde_json::to_vec(&body)?)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    /// Body bytes received so far.
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn content_length(&self) -> Result<usize> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid content-length '{}'", value)),
            None => Err(anyhow!("missing content-length")),
        }
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
