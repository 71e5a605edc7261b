use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{EngineBackend, EngineError, EngineFactory, InterruptHandle, WorkerId};

const ERROR_PREFIX: &str = "__clusteval_error__";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spawns one `R` process per worker.
#[derive(Debug, Clone)]
pub struct RProcessFactory {
    command: String,
    args: Vec<String>,
}

impl RProcessFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl Default for RProcessFactory {
    fn default() -> Self {
        Self::new("R", vec!["--vanilla".into(), "--slave".into()])
    }
}

impl EngineFactory for RProcessFactory {
    fn connect(&self, worker: WorkerId) -> Result<Box<dyn EngineBackend>, EngineError> {
        let backend = RProcessBackend::spawn(&self.command, &self.args)?;
        debug!(%worker, pid = backend.pid(), "started engine process");
        Ok(Box::new(backend))
    }
}

/// Line protocol over the stdin/stdout of an interactive `R` process.
///
/// Each command is wrapped in `try(...)` and followed by a unique end marker
/// so replies can be framed without a dedicated server such as Rserve.
pub struct RProcessBackend {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    sequence: u64,
    interrupt: InterruptHandle,
}

impl RProcessBackend {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, EngineError> {
        let spawn_error = |reason: String| EngineError::Spawn {
            command: command.to_string(),
            reason,
        };
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| spawn_error(err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout not captured".into()))?;
        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let killer = Arc::clone(&child);
        let interrupt = InterruptHandle::new().with_kill(move || {
            if let Err(err) = killer.lock().kill() {
                debug!(?err, "engine process already gone");
            }
        });
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            pid,
            sequence: 0,
            interrupt,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn read_reply(&mut self, marker: &str) -> Result<String, EngineError> {
        let mut output = Vec::new();
        let mut error = None;
        loop {
            let mut line = String::new();
            let read = self.stdout.read_line(&mut line);
            if self.interrupt.is_interrupted() {
                return Err(EngineError::Interrupted);
            }
            if read? == 0 {
                return Err(EngineError::Disconnected(format!(
                    "engine process {} closed its output",
                    self.pid
                )));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line == marker {
                break;
            }
            if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
                error = Some(message.trim().to_string());
            } else {
                output.push(line.to_string());
            }
        }
        match error {
            Some(message) => Err(EngineError::Evaluation(message)),
            None => Ok(output.join("\n").trim().to_string()),
        }
    }
}

impl EngineBackend for RProcessBackend {
    fn eval(&mut self, command: &str) -> Result<String, EngineError> {
        if self.interrupt.is_interrupted() {
            return Err(EngineError::Interrupted);
        }
        self.sequence += 1;
        let marker = format!("__clusteval_end_{}__", self.sequence);
        let script = format!(
            ".clusteval.res <- try(eval(parse(text = \"{}\")), silent = TRUE)\n\
             if (inherits(.clusteval.res, \"try-error\")) cat(\"{ERROR_PREFIX}\", \
             gsub(\"\\n\", \" \", as.character(.clusteval.res)), \"\\n\") \
             else if (!is.null(.clusteval.res)) print(.clusteval.res)\n\
             cat(\"\\n{marker}\\n\")\n",
            escape_r_string(command)
        );
        self.stdin.write_all(script.as_bytes())?;
        self.stdin.flush()?;
        self.read_reply(&marker)
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        if !self.interrupt.is_interrupted() {
            if let Err(err) = self.stdin.write_all(b"q(save = \"no\")\n") {
                debug!(?err, pid = self.pid, "engine stdin already closed");
            }
            let _ = self.stdin.flush();
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let mut child = self.child.lock();
            match child.try_wait()? {
                Some(_) => return Ok(()),
                None if Instant::now() >= deadline => {
                    warn!(pid = self.pid, "engine process ignored quit; killing");
                    child.kill()?;
                    child.wait()?;
                    return Ok(());
                }
                None => {}
            }
            drop(child);
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for RProcessBackend {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn escape_r_string(command: &str) -> String {
    let mut escaped = String::with_capacity(command.len());
    for ch in command.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            other => escaped.push(other),
        }
    }
    escaped
}
