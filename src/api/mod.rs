//! HTTP boundary for the detection pipeline.
//!
//! A small blocking HTTP/1.1 server: one accept loop on a nonblocking
//! listener, one thread per accepted connection, one request per connection.

mod multipart;

pub use multipart::{boundary_from_content_type, parse_form, select_upload, FormPart};

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::config::ApiSettings;
use crate::error::PipelineError;
use crate::pipeline::FoodPipeline;

const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ApiSettings::default())
    }
}

impl From<&ApiSettings> for ApiConfig {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            addr: settings.addr.clone(),
            max_body_bytes: settings.max_body_bytes,
            read_timeout: settings.read_timeout,
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

/// Request-level failures, each carrying its HTTP status.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    MalformedPayload(String),

    #[error("Request body of {0} bytes exceeds the {1} byte limit")]
    PayloadTooLarge(usize, usize),

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::MalformedPayload(_) => 400,
            ApiError::PayloadTooLarge(..) => 413,
            ApiError::NotFound => 404,
            ApiError::MethodNotAllowed => 405,
            ApiError::Pipeline(err) => err.status_code(),
        }
    }

    fn body(&self) -> Vec<u8> {
        serde_json::json!({ "detail": self.to_string() })
            .to_string()
            .into_bytes()
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: Arc<FoodPipeline>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<FoodPipeline>) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let pipeline = self.pipeline;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, pipeline, shutdown_thread) {
                log::error!("food api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    pipeline: Arc<FoodPipeline>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let pipeline = pipeline.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &pipeline) {
                        log::warn!("connection from {} dropped: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    pipeline: &FoodPipeline,
) -> Result<()> {
    // Accepted sockets may inherit the listener's nonblocking flag.
    stream.set_nonblocking(false)?;
    // A zero timeout is rejected by the socket; treat it as "no timeout".
    stream.set_read_timeout(Some(cfg.read_timeout).filter(|t| !t.is_zero()))?;

    let request = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => request,
        Err(err) => {
            log::warn!("rejected request: {}", err);
            return write_error(&mut stream, &err);
        }
    };

    let (method, path) = (request.method.clone(), request.path.clone());
    match route(request, pipeline) {
        Ok((status, body)) => write_response(&mut stream, status, "application/json", &body),
        Err(err) => {
            if err.status_code() >= 500 {
                log::error!("{} {} failed: {}", method, path, err);
            } else {
                log::warn!("{} {} rejected: {}", method, path, err);
            }
            write_error(&mut stream, &err)
        }
    }
}

fn route(request: HttpRequest, pipeline: &FoodPipeline) -> Result<(u16, Vec<u8>), ApiError> {
    let HttpRequest {
        method,
        path,
        headers,
        body,
    } = request;
    if method == "OPTIONS" {
        return Ok((204, Vec::new()));
    }
    match (method.as_str(), path.as_str()) {
        ("GET", "/") => Ok((
            200,
            br#"{"message":"API is running","status":"healthy"}"#.to_vec(),
        )),
        ("GET", "/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "model_loaded": pipeline.model_loaded(),
            });
            Ok((200, body.to_string().into_bytes()))
        }
        ("POST", "/predict/food") => predict_food(&headers, body, pipeline),
        (_, "/" | "/health" | "/predict/food") => Err(ApiError::MethodNotAllowed),
        _ => Err(ApiError::NotFound),
    }
}

fn predict_food(
    headers: &HashMap<String, String>,
    body: Vec<u8>,
    pipeline: &FoodPipeline,
) -> Result<(u16, Vec<u8>), ApiError> {
    let content_type = headers
        .get("content-type")
        .ok_or_else(|| ApiError::MalformedPayload("missing Content-Type header".into()))?;
    let boundary = boundary_from_content_type(content_type)
        .map_err(|e| ApiError::MalformedPayload(e.to_string()))?;
    let parts =
        parse_form(body, &boundary).map_err(|e| ApiError::MalformedPayload(e.to_string()))?;
    let upload = select_upload(parts)
        .ok_or_else(|| ApiError::MalformedPayload("no file part in upload".into()))?;
    log::debug!(
        "upload {} ({}, {} bytes)",
        upload.filename.as_deref().unwrap_or("<unnamed>"),
        upload.content_type,
        upload.data.len()
    );

    let batch = pipeline.detect_food(&upload.data, &upload.content_type)?;
    let body = serde_json::to_vec(&batch).map_err(|e| PipelineError::Internal(e.into()))?;
    Ok((200, body))
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, ApiError> {
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(ApiError::MalformedPayload("request headers too large".into()));
        }
        let n = stream.read(&mut buf).map_err(io_error)?;
        if n == 0 {
            return Err(ApiError::MalformedPayload("connection closed mid-request".into()));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ApiError::MalformedPayload("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ApiError::MalformedPayload("missing method".into()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| ApiError::MalformedPayload("missing path".into()))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ApiError::MalformedPayload(format!("bad Content-Length '{}'", value)))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(ApiError::PayloadTooLarge(content_length, max_body_bytes));
    }

    let mut body = data[header_end + 4..].to_vec();
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut buf).map_err(io_error)?;
        if n == 0 {
            return Err(ApiError::MalformedPayload("request body truncated".into()));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&buf[..take]);
    }

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body,
    })
}

fn io_error(err: std::io::Error) -> ApiError {
    ApiError::MalformedPayload(format!("failed to read request: {}", err))
}

fn write_error(stream: &mut TcpStream, err: &ApiError) -> Result<()> {
    write_response(stream, err.status_code(), "application/json", &err.body())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: *\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
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
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}
