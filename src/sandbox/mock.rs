//! In-memory sandbox for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CommandOutput, OutputSink, SandboxError, SandboxProvider, SandboxSession};

/// Shared state behind every session the mock hands out.
#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    scripted: VecDeque<Result<CommandOutput, SandboxError>>,
    failing_paths: HashSet<String>,
    destroyed: Vec<String>,
    preview_scheme: Option<String>,
}

/// Sandbox provider backed by an in-memory file map.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSandbox {
    state: Arc<Mutex<MockState>>,
    provision_failures: Arc<AtomicUsize>,
    connect_failures: Arc<AtomicUsize>,
    provision_count: Arc<AtomicUsize>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` provision calls.
    pub fn fail_provisions(self, n: usize) -> Self {
        self.provision_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` connect calls.
    pub fn fail_connects(self, n: usize) -> Self {
        self.connect_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Serve previews over `scheme` instead of https.
    pub fn with_preview_scheme(self, scheme: &str) -> Self {
        self.lock().preview_scheme = Some(scheme.to_string());
        self
    }

    /// Queue the result of the next `run_command`.
    pub fn script_command(&self, result: Result<CommandOutput, SandboxError>) {
        self.lock().scripted.push_back(result);
    }

    /// Make writes and reads of `path` fail.
    pub fn fail_path(&self, path: &str) {
        self.lock().failing_paths.insert(path.to_string());
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        self.lock().files.insert(path.to_string(), content.to_string());
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.lock().files.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn provision_count(&self) -> usize {
        self.provision_count.load(Ordering::SeqCst)
    }

    /// Ids passed to `destroy`, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.lock().destroyed.clone()
    }

    fn scheme(&self) -> String {
        self.lock()
            .preview_scheme
            .clone()
            .unwrap_or_else(|| "https".to_string())
    }

    /// Open a session directly, bypassing provisioning.
    pub fn session(&self) -> MockSession {
        MockSession {
            id: "mock-sandbox".to_string(),
            scheme: self.scheme(),
            sandbox: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SandboxProvider for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn provision(&self, _template: &str, _timeout: Duration) -> Result<String, SandboxError> {
        self.provision_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.provision_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.provision_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::unavailable("mock provision failure"));
        }
        Ok("mock-sandbox".to_string())
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::unavailable("mock connect failure"));
        }
        Ok(Box::new(MockSession {
            id: sandbox_id.to_string(),
            scheme: self.scheme(),
            sandbox: self.clone(),
        }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.lock().destroyed.push(sandbox_id.to_string());
        Ok(())
    }
}

pub(crate) struct MockSession {
    id: String,
    scheme: String,
    sandbox: MockSandbox,
}

#[async_trait]
impl SandboxSession for MockSession {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        let scripted = {
            let mut state = self.sandbox.lock();
            state.commands.push(command.to_string());
            state.scripted.pop_front()
        };
        let output = scripted.unwrap_or_else(|| {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        })?;
        sink.on_stdout(&output.stdout);
        sink.on_stderr(&output.stderr);
        Ok(output)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let mut state = self.sandbox.lock();
        if state.failing_paths.contains(path) {
            return Err(SandboxError::operation_failed(format!("cannot write {path}")));
        }
        state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let state = self.sandbox.lock();
        if state.failing_paths.contains(path) {
            return Err(SandboxError::operation_failed(format!("cannot read {path}")));
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(path))
    }

    async fn host(&self, port: u16) -> Result<String, SandboxError> {
        Ok(format!("{port}-{}.mock.local", self.id))
    }

    fn preview_scheme(&self) -> &str {
        &self.scheme
    }
}
