//! JSON control surface over a minimal HTTP/1.1 server.
//!
//! One accept thread polls a nonblocking listener; each connection is handled
//! on its own short-lived thread. Handlers only talk to the `Monitor`, never
//! to the pipeline directly.

use crate::error::MonitorError;
use crate::ingest::SourceConfig;
use crate::monitor::Monitor;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
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

pub struct ApiServer {
    cfg: ApiConfig,
    monitor: Arc<Monitor>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, monitor: Arc<Monitor>) -> Self {
        Self { cfg, monitor }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
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

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let monitor = self.monitor;
        let join = std::thread::Builder::new()
            .name("helmet-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, monitor, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, monitor: Arc<Monitor>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let monitor = Arc::clone(&monitor);
                let spawned = std::thread::Builder::new()
                    .name("helmet-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &monitor) {
                            log::warn!("control api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("control api could not spawn connection thread: {}", err);
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

fn handle_connection(mut stream: TcpStream, monitor: &Monitor) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, &json!({"error": "payload_too_large"}))?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, &json!({"error": "bad_request"}))?;
            return Err(err);
        }
    };
    let (status, body) = route(monitor, &request);
    log::debug!("{} {} -> {}", request.method, request.path, status);
    write_json_response(&mut stream, status, &body)
}

/// Dispatch a parsed request to its handler.
pub(crate) fn route(monitor: &Monitor, request: &HttpRequest) -> (u16, Value) {
    let method = request.method.as_str();
    let allowed = match request.path.as_str() {
        "/health" | "/api/frame" | "/api/logs" | "/api/stats" | "/api/sources" => "GET",
        "/api/toggle_detection"
        | "/api/update_chat_id"
        | "/api/test_notification"
        | "/api/select_source"
        | "/api/test_source" => "POST",
        _ => return (404, json!({"error": "not_found"})),
    };
    if method != allowed {
        return (405, json!({"error": "method_not_allowed"}));
    }

    match request.path.as_str() {
        "/health" => (200, json!({"status": "ok"})),
        "/api/frame" => frame(monitor),
        "/api/logs" => to_body(&monitor.logs()),
        "/api/stats" => to_body(&monitor.stats()),
        "/api/sources" => {
            let listing = monitor.list_sources();
            (
                200,
                json!({"success": true, "active": listing.active, "sources": listing.sources}),
            )
        }
        "/api/toggle_detection" => {
            let active = monitor.toggle_detection();
            (200, json!({"success": true, "detection_active": active}))
        }
        "/api/update_chat_id" => update_chat_id(monitor, request),
        "/api/test_notification" => match monitor.send_test_notification() {
            Ok(()) => (
                200,
                json!({"success": true, "message": "test notification sent"}),
            ),
            Err(err) => error_body(&err),
        },
        "/api/select_source" => match parse_source(request) {
            Ok(source) => match monitor.change_source(source.clone()) {
                Ok(()) => (200, json!({"success": true, "source": source})),
                Err(err) => error_body(&MonitorError::from(err)),
            },
            Err(err) => error_body(&err),
        },
        "/api/test_source" => match parse_source(request).and_then(|s| monitor.test_source(&s)) {
            Ok(check) => (
                200,
                json!({"success": true, "width": check.width, "height": check.height}),
            ),
            Err(err) => error_body(&err),
        },
        _ => (404, json!({"error": "not_found"})),
    }
}

fn frame(monitor: &Monitor) -> (u16, Value) {
    match monitor.frame() {
        Some((encoded, violation)) => (
            200,
            json!({
                "success": true,
                "frame": encoded,
                "violation": violation,
                "detection_active": monitor.detection_active(),
                "stats": monitor.stats(),
            }),
        ),
        None => error_body(&MonitorError::NoFrame),
    }
}

fn update_chat_id(monitor: &Monitor, request: &HttpRequest) -> (u16, Value) {
    let body = match request.json() {
        Ok(body) => body,
        Err(err) => return error_body(&err),
    };
    // Numeric ids may arrive as JSON numbers.
    let chat_id = match body.get("chat_id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return error_body(&MonitorError::InvalidInput(
                "chat_id is required".to_string(),
            ))
        }
    };
    match monitor.set_destination(&chat_id) {
        Ok(chat_id) => (
            200,
            json!({
                "success": true,
                "chat_id": chat_id,
                "message": format!("chat id updated to {chat_id}"),
            }),
        ),
        Err(err) => error_body(&err),
    }
}

/// Accepts `{"source": "device:0"}` or a tagged `{"kind": "file", "path": …}`.
fn parse_source(request: &HttpRequest) -> Result<SourceConfig, MonitorError> {
    let body = request.json()?;
    if let Some(spec) = body.get("source").and_then(Value::as_str) {
        return SourceConfig::parse(spec).map_err(MonitorError::InvalidInput);
    }
    serde_json::from_value(body)
        .map_err(|err| MonitorError::InvalidInput(format!("invalid source: {err}")))
}

fn error_body(err: &MonitorError) -> (u16, Value) {
    let status = match err {
        MonitorError::InvalidInput(_) => 400,
        MonitorError::NoFrame => 503,
        MonitorError::Pipeline(_) | MonitorError::Config(_) => 500,
    };
    (status, json!({"success": false, "error": err.to_string()}))
}

fn to_body<T: serde::Serialize>(value: &T) -> (u16, Value) {
    match serde_json::to_value(value) {
        Ok(body) => (200, body),
        Err(err) => (500, json!({"success": false, "error": err.to_string()})),
    }
}

enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

fn read_request(stream: &mut TcpStream) -> std::result::Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break find_header_end(&data);
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = find_header_end(&data) {
            break Some(end);
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
    };
    let header_end =
        header_end.ok_or_else(|| RequestError::Malformed(anyhow!("incomplete request head")))?;

    let mut request = parse_head(&data[..header_end]).map_err(RequestError::Malformed)?;
    let content_length = match request.headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    if body.len() < content_length {
        return Err(RequestError::Malformed(anyhow!("truncated request body")));
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(head);
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
        body: Vec::new(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
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
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
pub(crate) struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn json(&self) -> std::result::Result<Value, MonitorError> {
        if self.body.is_empty() {
            return Err(MonitorError::InvalidInput("request body is required".into()));
        }
        serde_json::from_slice(&self.body)
            .map_err(|err| MonitorError::InvalidInput(format!("invalid JSON body: {err}")))
    }
}
