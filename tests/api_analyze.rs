use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use tempfile::{tempdir, TempDir};

use kiosk_vision::api::{ApiConfig, ApiHandle, ApiServer};
use kiosk_vision::synthetic::{empty_kiosk, hat_wearer};
use kiosk_vision::{Frame, KioskConfig};

struct TestApi {
    _dir: TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(max_body_bytes: Option<usize>) -> Result<Self> {
        let dir = tempdir()?;
        let kiosk_cfg = KioskConfig {
            db_path: dir.path().join("kiosk.db").to_string_lossy().to_string(),
            ..KioskConfig::default()
        };
        let defaults = ApiConfig::default();
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            token_path: Some(dir.path().join("api.token")),
            max_body_bytes: max_body_bytes.unwrap_or(defaults.max_body_bytes),
        };
        let api_handle = ApiServer::new(api_config, kiosk_cfg).spawn()?;
        Ok(Self {
            _dir: dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn addr(&self) -> SocketAddr {
        self.handle().addr
    }

    fn token(&self) -> String {
        self.handle().token.clone()
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn send(addr: SocketAddr, raw: &[u8]) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(raw)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> Result<(String, String)> {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
    if let Some(token) = token {
        raw.push_str(&format!("Authorization: Bearer {token}\r\n"));
    }
    let body = body.unwrap_or("");
    if method == "POST" {
        raw.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    send(addr, raw.as_bytes())
}

fn pixels_hex(frame: &Frame) -> String {
    let mut bytes = Vec::with_capacity(frame.width() as usize * frame.height() as usize * 3);
    for y in 0..frame.height() {
        for x in 0..frame.width() {
            bytes.extend_from_slice(&frame.pixel(x, y));
        }
    }
    hex::encode(bytes)
}

fn hat_request(session_id: Option<&str>) -> Value {
    let scene = hat_wearer();
    let mut body = json!({
        "width": scene.frame.width(),
        "height": scene.frame.height(),
        "pixels_hex": pixels_hex(&scene.frame),
        "context": scene.context,
    });
    if let Some(id) = session_id {
        body["session_id"] = json!(id);
    }
    body
}

#[test]
fn health_needs_no_token() -> Result<()> {
    let api = TestApi::new(None)?;
    let (headers, body) = request(api.addr(), "GET", "/health", None, None)?;
    assert!(headers.contains("200 OK"));
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"status": "ok"}));
    Ok(())
}

#[test]
fn analyze_requires_a_valid_token() -> Result<()> {
    let api = TestApi::new(None)?;
    // Rejected before the body is read, so none is sent.
    let body = String::new();

    let (headers, body_out) = request(api.addr(), "POST", "/analyze", None, Some(&body))?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body_out.contains("missing_token"));

    let wrong = hex::encode([7u8; 32]);
    let (headers, body_out) = request(api.addr(), "POST", "/analyze", Some(&wrong), Some(&body))?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body_out.contains("invalid_token"));

    let path = format!("/analyze?token={}", api.token());
    let (headers, _) = request(api.addr(), "POST", &path, None, Some(&body))?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn token_file_holds_the_capability_token() -> Result<()> {
    let api = TestApi::new(None)?;
    let path = api.handle().token_path.clone().expect("token path");
    let written = std::fs::read_to_string(&path)?;
    assert_eq!(written.trim(), api.token());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    Ok(())
}

#[test]
fn analyze_returns_presented_profile_and_records_session() -> Result<()> {
    let api = TestApi::new(None)?;
    let token = api.token();
    let body = hat_request(Some("kiosk-1:s1")).to_string();

    let (headers, out) = request(api.addr(), "POST", "/analyze", Some(&token), Some(&body))?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let profile: Value = serde_json::from_str(&out)?;
    assert_eq!(profile["head_accessory"]["label"], "hat");
    assert_eq!(profile["state"], "partial_evidence");
    assert_eq!(profile["fallback_used"], false);
    let confidence = profile["head_accessory"]["confidence"].as_f64().expect("confidence");
    assert!((confidence * 100.0 - (confidence * 100.0).round()).abs() < 1e-3);

    let (headers, out) = request(
        api.addr(),
        "GET",
        "/sessions/kiosk-1:s1/profile",
        Some(&token),
        None,
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let stored: Value = serde_json::from_str(&out)?;
    assert_eq!(stored["session_id"], "kiosk-1:s1");
    assert_eq!(stored["profile"], profile);
    assert_eq!(stored["digest"].as_str().map(str::len), Some(64));
    Ok(())
}

#[test]
fn analyze_without_session_records_nothing() -> Result<()> {
    let api = TestApi::new(None)?;
    let token = api.token();
    let scene = empty_kiosk();
    let body = json!({
        "width": scene.frame.width(),
        "height": scene.frame.height(),
        "pixels_hex": pixels_hex(&scene.frame),
    })
    .to_string();

    let (headers, out) = request(api.addr(), "POST", "/analyze", Some(&token), Some(&body))?;
    assert!(headers.contains("200 OK"));
    let profile: Value = serde_json::from_str(&out)?;
    assert_eq!(profile["state"], "no_person");
    assert_eq!(profile["fallback_used"], true);

    let (headers, out) = request(
        api.addr(),
        "GET",
        "/sessions/kiosk-9/profile",
        Some(&token),
        None,
    )?;
    assert!(headers.contains("404 Not Found"));
    assert!(out.contains("no_profile"));
    Ok(())
}

#[test]
fn malformed_requests_are_bad_requests() -> Result<()> {
    let api = TestApi::new(None)?;
    let token = api.token();

    let (headers, out) = request(api.addr(), "POST", "/analyze", Some(&token), Some("{not json"))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(out.contains("invalid_request"));

    let short = json!({"width": 4, "height": 4, "pixels_hex": "00ff00"}).to_string();
    let (headers, out) = request(api.addr(), "POST", "/analyze", Some(&token), Some(&short))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(out.contains("invalid_input"));

    let zero = json!({"width": 0, "height": 0, "pixels_hex": ""}).to_string();
    let (headers, out) = request(api.addr(), "POST", "/analyze", Some(&token), Some(&zero))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(out.contains("invalid_input"));

    let bad_session = hat_request(Some("no spaces allowed"));
    let (headers, out) = request(
        api.addr(),
        "POST",
        "/analyze",
        Some(&token),
        Some(&bad_session.to_string()),
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert!(out.contains("invalid_session"));

    let (headers, _) = request(api.addr(), "GET", "/analyze", Some(&token), None)?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn oversized_bodies_are_refused() -> Result<()> {
    let api = TestApi::new(Some(256))?;
    let raw = format!(
        "POST /analyze HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {}\r\n\
         Content-Length: 4096\r\n\r\n",
        api.token()
    );
    let (headers, out) = send(api.addr(), raw.as_bytes())?;
    assert!(headers.contains("413 Payload Too Large"));
    assert!(out.contains("body_too_large"));
    Ok(())
}
