use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use clusteval_plugin_sdk::CapabilityKind;
use clusteval_registry::BindingSummary;
use clusteval_run::RunProgress;
use clusteval_scheduler::{ActiveRunnable, OptimizationStatus};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::rpc::{methods, Request, Response, RpcError};

/// Blocking client for the control server.
///
/// The client id is fetched from the server on first use unless one was
/// supplied with [`with_client_id`](Self::with_client_id); reuse an id to
/// act on runs submitted earlier.
pub struct RemoteClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
    client_id: Option<String>,
}

impl RemoteClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            next_id: 1,
            client_id: None,
        })
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_id(&mut self) -> Result<String, RpcError> {
        if let Some(id) = &self.client_id {
            return Ok(id.clone());
        }
        let id: String = self.call(methods::GET_CLIENT_ID, Value::Null)?;
        debug!(client = %id, "obtained client id");
        self.client_id = Some(id.clone());
        Ok(id)
    }

    /// Sends one request and waits for its response.
    pub fn call<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_string(&Request::new(id, method, params))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            return Err(RpcError::Closed);
        }
        let response: Response = serde_json::from_str(&reply)?;
        if response.id != Value::from(id) {
            return Err(RpcError::UnexpectedId {
                expected: id,
                found: response.id,
            });
        }
        Ok(serde_json::from_value(response.into_result()?)?)
    }

    pub fn get_runs(&mut self) -> Result<Vec<String>, RpcError> {
        self.call(methods::GET_RUNS, Value::Null)
    }

    pub fn get_run_resumes(&mut self) -> Result<Vec<String>, RpcError> {
        self.call(methods::GET_RUN_RESUMES, Value::Null)
    }

    pub fn get_queue(&mut self) -> Result<Vec<String>, RpcError> {
        self.call(methods::GET_QUEUE, Value::Null)
    }

    pub fn get_capabilities(
        &mut self,
        kind: Option<CapabilityKind>,
    ) -> Result<Vec<BindingSummary>, RpcError> {
        let kind = kind.map(|kind| kind.suffix().to_string());
        self.call(methods::GET_CAPABILITIES, json!({ "kind": kind }))
    }

    pub fn get_active_runnables(&mut self) -> Result<Vec<ActiveRunnable>, RpcError> {
        self.call(methods::GET_ACTIVE_RUNNABLES, Value::Null)
    }

    pub fn perform_run(&mut self, run: &str) -> Result<bool, RpcError> {
        let client = self.client_id()?;
        self.call(methods::PERFORM_RUN, json!({ "clientId": client, "runId": run }))
    }

    pub fn resume_run(&mut self, result: &str) -> Result<bool, RpcError> {
        let client = self.client_id()?;
        self.call(methods::RESUME_RUN, json!({ "clientId": client, "resultId": result }))
    }

    pub fn terminate_run(&mut self, run: &str) -> Result<bool, RpcError> {
        let client = self.client_id()?;
        self.call(methods::TERMINATE_RUN, json!({ "clientId": client, "runId": run }))
    }

    pub fn get_run_status(&mut self) -> Result<BTreeMap<String, RunProgress>, RpcError> {
        let client = self.client_id()?;
        self.call(methods::GET_RUN_STATUS_FOR_CLIENT_ID, json!({ "clientId": client }))
    }

    pub fn get_optimization_run_status(
        &mut self,
    ) -> Result<BTreeMap<String, OptimizationStatus>, RpcError> {
        let client = self.client_id()?;
        self.call(
            methods::GET_OPTIMIZATION_RUN_STATUS_FOR_CLIENT_ID,
            json!({ "clientId": client }),
        )
    }

    pub fn set_thread_number(&mut self, threads: usize) -> Result<usize, RpcError> {
        self.call(methods::SET_THREAD_NUMBER, json!({ "threads": threads }))
    }

    pub fn set_log_level(&mut self, level: &str) -> Result<(), RpcError> {
        self.call(methods::SET_LOG_LEVEL, json!({ "level": level }))
    }

    /// Returns how many runnables the server had to force-terminate.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<usize, RpcError> {
        let client = self.client_id()?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.call(methods::SHUTDOWN, json!({ "clientId": client, "timeoutMs": timeout_ms }))
    }
}
