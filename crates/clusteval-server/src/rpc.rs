//! JSON-RPC 2.0 over TCP, one request or response object per line.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clusteval_plugin_sdk::CapabilityKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::facade::{ControlError, ControlFacade};
use crate::logging::LogLevelError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Longest request line a connection accepts, newline excluded.
pub const MAX_REQUEST_LINE: usize = 1 << 20;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// How long a stopping server waits for responses still being written.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub mod methods {
    pub const GET_CLIENT_ID: &str = "getClientId";
    pub const GET_RUNS: &str = "getRuns";
    pub const GET_RUN_RESUMES: &str = "getRunResumes";
    pub const GET_QUEUE: &str = "getQueue";
    pub const GET_CAPABILITIES: &str = "getCapabilities";
    pub const GET_ACTIVE_RUNNABLES: &str = "getActiveRunnables";
    pub const PERFORM_RUN: &str = "performRun";
    pub const RESUME_RUN: &str = "resumeRun";
    pub const TERMINATE_RUN: &str = "terminateRun";
    pub const GET_RUN_STATUS_FOR_CLIENT_ID: &str = "getRunStatusForClientId";
    pub const GET_OPTIMIZATION_RUN_STATUS_FOR_CLIENT_ID: &str =
        "getOptimizationRunStatusForClientId";
    pub const SET_THREAD_NUMBER: &str = "setThreadNumber";
    pub const SET_LOG_LEVEL: &str = "setLogLevel";
    pub const SHUTDOWN: &str = "shutdown";
}

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const UNKNOWN_CLIENT: i64 = -32001;
    pub const UNAUTHORIZED: i64 = -32002;
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("server closed the connection")]
    Closed,

    #[error("response id {found} does not match request id {expected}")]
    UnexpectedId { expected: u64, found: Value },
}

impl RpcError {
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    /// Absent for notifications, which get no response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ControlError> for ErrorObject {
    fn from(err: ControlError) -> Self {
        let code = match &err {
            ControlError::UnknownClient(_) => codes::UNKNOWN_CLIENT,
            ControlError::Unauthorized { .. } => codes::UNAUTHORIZED,
            ControlError::LogLevel(LogLevelError::Unknown(_)) => codes::INVALID_PARAMS,
            ControlError::LogLevel(LogLevelError::Unavailable(_)) | ControlError::Results(_) => {
                codes::INTERNAL_ERROR
            }
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// The result, or the error the server reported. A `null` result
    /// deserializes as `None` and is handed out as `Value::Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientParams {
    client_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    client_id: String,
    run_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeParams {
    client_id: String,
    result_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShutdownParams {
    client_id: String,
    #[serde(default)]
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct ThreadParams {
    #[serde(alias = "n")]
    threads: usize,
}

#[derive(Deserialize)]
struct LevelParams {
    level: String,
}

#[derive(Deserialize)]
struct KindParams {
    #[serde(default)]
    kind: Option<String>,
}

/// Decodes named (object) or positional (array) parameters.
fn params<T: DeserializeOwned>(params: Value, names: &[&str]) -> Result<T, ErrorObject> {
    let named = match params {
        Value::Array(values) => {
            if values.len() > names.len() {
                return Err(ErrorObject::new(
                    codes::INVALID_PARAMS,
                    format!("expected at most {} parameters", names.len()),
                ));
            }
            Value::Object(
                names
                    .iter()
                    .map(|name| name.to_string())
                    .zip(values)
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(named)
        .map_err(|err| ErrorObject::new(codes::INVALID_PARAMS, err.to_string()))
}

fn encode<T: Serialize>(value: T) -> Result<Value, ErrorObject> {
    serde_json::to_value(value)
        .map_err(|err| ErrorObject::new(codes::INTERNAL_ERROR, err.to_string()))
}

fn call(facade: &ControlFacade, method: &str, raw: Value) -> Result<Value, ErrorObject> {
    use methods::*;

    match method {
        GET_CLIENT_ID => encode(facade.get_client_id()),
        GET_RUNS => encode(facade.get_runs()),
        GET_RUN_RESUMES => encode(facade.get_run_resumes()?),
        GET_QUEUE => encode(facade.get_queue()),
        GET_ACTIVE_RUNNABLES => encode(facade.get_active_runnables()),
        GET_CAPABILITIES => {
            let p: KindParams = params(raw, &["kind"])?;
            let kind = p
                .kind
                .map(|kind| kind.parse::<CapabilityKind>())
                .transpose()
                .map_err(|err| ErrorObject::new(codes::INVALID_PARAMS, err.to_string()))?;
            encode(facade.get_capabilities(kind))
        }
        PERFORM_RUN => {
            let p: RunParams = params(raw, &["clientId", "runId"])?;
            encode(facade.perform_run(&p.client_id, &p.run_id)?)
        }
        RESUME_RUN => {
            let p: ResumeParams = params(raw, &["clientId", "resultId"])?;
            encode(facade.resume_run(&p.client_id, &p.result_id)?)
        }
        TERMINATE_RUN => {
            let p: RunParams = params(raw, &["clientId", "runId"])?;
            encode(facade.terminate_run(&p.client_id, &p.run_id)?)
        }
        GET_RUN_STATUS_FOR_CLIENT_ID => {
            let p: ClientParams = params(raw, &["clientId"])?;
            encode(facade.get_run_status_for_client_id(&p.client_id)?)
        }
        GET_OPTIMIZATION_RUN_STATUS_FOR_CLIENT_ID => {
            let p: ClientParams = params(raw, &["clientId"])?;
            encode(facade.get_optimization_run_status_for_client_id(&p.client_id)?)
        }
        SET_THREAD_NUMBER => {
            let p: ThreadParams = params(raw, &["threads"])?;
            encode(facade.set_thread_number(p.threads))
        }
        SET_LOG_LEVEL => {
            let p: LevelParams = params(raw, &["level"])?;
            facade.set_log_level(&p.level)?;
            Ok(Value::Null)
        }
        SHUTDOWN => {
            let p: ShutdownParams = params(raw, &["clientId", "timeoutMs"])?;
            encode(facade.shutdown(&p.client_id, Duration::from_millis(p.timeout_ms))?)
        }
        other => Err(ErrorObject::new(
            codes::METHOD_NOT_FOUND,
            format!("unknown method `{other}`"),
        )),
    }
}

/// Handles one line of input. Returns `None` for notifications.
pub fn handle_line(facade: &ControlFacade, line: &str) -> Option<Response> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            return Some(Response::failure(
                Value::Null,
                ErrorObject::new(codes::PARSE_ERROR, err.to_string()),
            ))
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            return Some(Response::failure(
                id,
                ErrorObject::new(codes::INVALID_REQUEST, err.to_string()),
            ))
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Some(Response::failure(
            id,
            ErrorObject::new(codes::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        ));
    }

    debug!(method = %request.method, "rpc call");
    let outcome = call(facade, &request.method, request.params);
    let id = request.id?;
    Some(match outcome {
        Ok(result) => Response::success(id, result),
        Err(error) => {
            debug!(code = error.code, message = %error.message, "rpc call failed");
            Response::failure(id, error)
        }
    })
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts connections until the facade has been shut down.
pub struct RpcServer {
    listener: TcpListener,
    facade: Arc<ControlFacade>,
    in_flight: Arc<AtomicUsize>,
}

impl RpcServer {
    pub fn bind(addr: impl ToSocketAddrs, facade: Arc<ControlFacade>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            facade,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until shutdown, then waits for responses still in flight.
    pub fn serve(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "control server listening");
        while !self.facade.is_shut_down() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    warn!(%err, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        info!("control server stopped");
        Ok(())
    }

    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name("rpc-listener".into())
            .spawn(move || self.serve())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let facade = Arc::clone(&self.facade);
        let in_flight = Arc::clone(&self.in_flight);
        let spawned = thread::Builder::new()
            .name(format!("rpc-{peer}"))
            .spawn(move || {
                debug!(%peer, "client connected");
                if let Err(err) = serve_connection(stream, &facade, &in_flight) {
                    debug!(%peer, %err, "connection closed with error");
                }
                debug!(%peer, "client disconnected");
            });
        if let Err(err) = spawned {
            warn!(%peer, %err, "failed to spawn connection thread");
        }
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    Line(String),
    /// More than [`MAX_REQUEST_LINE`] bytes arrived without a newline.
    TooLong,
    Eof,
}

/// Reads one request line, never buffering more than
/// [`MAX_REQUEST_LINE`] bytes of it.
fn read_frame<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame> {
    buf.clear();
    let limit = MAX_REQUEST_LINE as u64 + 1;
    if reader.by_ref().take(limit).read_until(b'\n', buf)? == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_REQUEST_LINE {
        return Ok(Frame::TooLong);
    }
    Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()))
}

fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    let encoded = serde_json::to_string(response).unwrap_or_else(|err| {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": Value::Null,
            "error": { "code": codes::INTERNAL_ERROR, "message": err.to_string() },
        })
        .to_string()
    });
    writer.write_all(encoded.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn serve_connection(
    stream: TcpStream,
    facade: &ControlFacade,
    in_flight: &Arc<AtomicUsize>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut buf = Vec::new();
    loop {
        let line = match read_frame(&mut reader, &mut buf)? {
            Frame::Line(line) => line,
            Frame::Eof => return Ok(()),
            Frame::TooLong => {
                // The rest of the line cannot be framed; answer and hang up.
                warn!(limit = MAX_REQUEST_LINE, "request line too long");
                let error = ErrorObject::new(
                    codes::PARSE_ERROR,
                    format!("request line exceeds {MAX_REQUEST_LINE} bytes"),
                );
                return write_response(&mut writer, &Response::failure(Value::Null, error));
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _guard = InFlight::enter(in_flight);
        if let Some(response) = handle_line(facade, &line) {
            write_response(&mut writer, &response)?;
        }
    }
}
