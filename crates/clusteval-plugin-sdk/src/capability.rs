use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clusteval_rengine::{EngineError, EngineSession};
use thiserror::Error;
use tracing::debug;

use crate::{render_template, CapabilityDescriptor, Invocation};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("`{name}` needs an engine session but none is available")]
    SessionRequired { name: String },
    #[error("failed to start `{executable}`: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{name}` exited with status {code:?}")]
    ExitStatus { name: String, code: Option<i32> },
    #[error("template placeholder `{placeholder}` has no value")]
    Template { placeholder: String },
    #[error("invocation cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        match self {
            CapabilityError::Engine(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CapabilityError::Cancelled | CapabilityError::Engine(EngineError::Interrupted)
        )
    }
}

/// Cooperative cancellation flag shared between a runnable and its canceller.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelFlag").field(&self.is_cancelled()).finish()
    }
}

/// Input to a single capability invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    /// Values for `{{placeholder}}` substitution.
    pub values: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl InvocationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutput {
    pub output: String,
}

/// A live capability implementation.
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Executes the capability. The default interprets the descriptor's
    /// [`Invocation`].
    fn invoke(
        &self,
        request: &InvocationRequest,
        session: Option<&mut EngineSession>,
        cancel: &CancelFlag,
    ) -> Result<InvocationOutput, CapabilityError> {
        let descriptor = self.descriptor();
        if cancel.is_cancelled() {
            return Err(CapabilityError::Cancelled);
        }
        match &descriptor.invocation {
            Invocation::None => Ok(InvocationOutput::default()),
            Invocation::RScript { script } => {
                let session = session.ok_or_else(|| CapabilityError::SessionRequired {
                    name: descriptor.name.clone(),
                })?;
                for library in &descriptor.required_libraries {
                    session.load_library(library, &descriptor.name)?;
                }
                let script = render_template(script, &request.values)?;
                let output = session.eval(&script)?;
                Ok(InvocationOutput { output })
            }
            Invocation::Command { executable, args } => {
                let executable = render_template(executable, &request.values)?;
                let args = args
                    .iter()
                    .map(|arg| render_template(arg, &request.values))
                    .collect::<Result<Vec<_>, _>>()?;
                run_command(&descriptor.name, &executable, &args, request, cancel)
            }
        }
    }
}

fn run_command(
    name: &str,
    executable: &str,
    args: &[String],
    request: &InvocationRequest,
    cancel: &CancelFlag,
) -> Result<InvocationOutput, CapabilityError> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(|source| CapabilityError::Spawn {
        executable: executable.to_string(),
        source,
    })?;
    debug!(name, executable, pid = child.id(), "started external program");

    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = stdout.read_to_string(&mut buffer);
            buffer
        })
    });

    let status = loop {
        if cancel.is_cancelled() {
            debug!(name, pid = child.id(), "killing cancelled external program");
            let _ = child.kill();
            let _ = child.wait();
            return Err(CapabilityError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(CapabilityError::Other(err.to_string())),
        }
    };
    let output = reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if status.success() {
        Ok(InvocationOutput {
            output: output.trim_end().to_string(),
        })
    } else {
        Err(CapabilityError::ExitStatus {
            name: name.to_string(),
            code: status.code(),
        })
    }
}

/// Capability whose behaviour is fully described by its descriptor.
#[derive(Debug, Clone)]
pub struct DeclaredCapability {
    descriptor: CapabilityDescriptor,
}

impl DeclaredCapability {
    pub fn new(descriptor: CapabilityDescriptor) -> Self {
        Self { descriptor }
    }
}

impl Capability for DeclaredCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }
}

/// Creates instances of one capability implementation.
pub trait CapabilityFactory: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;
    fn create(&self) -> Arc<dyn Capability>;
}

/// Factory for [`DeclaredCapability`] instances.
#[derive(Debug, Clone)]
pub struct DeclaredFactory {
    descriptor: CapabilityDescriptor,
}

impl DeclaredFactory {
    pub fn new(descriptor: CapabilityDescriptor) -> Self {
        Self { descriptor }
    }
}

impl CapabilityFactory for DeclaredFactory {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    fn create(&self) -> Arc<dyn Capability> {
        Arc::new(DeclaredCapability::new(self.descriptor.clone()))
    }
}

pub struct PluginModule {
    factories: Vec<Box<dyn CapabilityFactory>>,
}

impl PluginModule {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register_factory(&mut self, factory: Box<dyn CapabilityFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn CapabilityFactory> {
        self.factories.iter().map(|factory| factory.as_ref())
    }

    pub fn into_factories(self) -> Vec<Box<dyn CapabilityFactory>> {
        self.factories
    }
}

impl Default for PluginModule {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PluginExport {
    module: PluginModule,
}

impl PluginExport {
    pub fn new(module: PluginModule) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &PluginModule {
        &self.module
    }

    pub fn into_module(self) -> PluginModule {
        self.module
    }
}
