//! Subprocess runner: executes Python and Ruby handlers in an interpreter
//! child process.
//!
//! The host writes one JSON envelope per line to the child's stdin. The child
//! answers on stdout with lines prefixed by `__|response|__`; every other
//! stdout line is handler output and is re-emitted through `tracing`. A line
//! on stderr prefixed by `__|error|__` reports an error the child could not
//! attribute to any invocation (import failures included).
//!
//! With source watching enabled the runner respawns its child whenever the
//! handler module changes, reporting `Reloading` and then `Reloaded` to its
//! owner. Mount, unmount and reload are serialized by one lifecycle lock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use localfaas_core::{ErrorPayload, FunctionDefinition, Runtime, WorkerLine, WorkerMessage, WorkerReply};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use super::pending::PendingCalls;
use super::{Runner, RunnerError, RunnerEvent, RunnerHook, HANDLER_TARGET};
use crate::config::EmulatorConfig;
use crate::invocation::{InvocationOutput, InvocationRequest};

const PYTHON_BOOTSTRAP: &str = include_str!("bootstrap/python.py");
const RUBY_BOOTSTRAP: &str = include_str!("bootstrap/ruby.rb");

/// Longest stdout/stderr line accepted from a child.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// How long a graceful unmount waits for the child to exit on stdin EOF.
const UNMOUNT_GRACE: Duration = Duration::from_secs(2);

/// Quiet period after the last file event before a reload starts.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(120);

/// How the child process is started.
#[derive(Debug, Clone)]
enum Launch {
    /// Interpreter running an embedded bootstrap script.
    Bootstrap {
        interpreter: String,
        script: &'static str,
        file_name: &'static str,
        unbuffered: bool,
    },
    /// Arbitrary command speaking the wire protocol.
    Command { program: String, args: Vec<String> },
}

impl Launch {
    fn for_runtime(runtime: &Runtime, config: &EmulatorConfig) -> Self {
        let (family, script, file_name) = match runtime {
            Runtime::Ruby(_) => ("ruby", RUBY_BOOTSTRAP, "ruby.rb"),
            _ => ("python", PYTHON_BOOTSTRAP, "python.py"),
        };
        let interpreter = config
            .interpreter_overrides
            .get(family)
            .cloned()
            .or_else(|| runtime.interpreter().map(ToString::to_string))
            .unwrap_or_else(|| family.to_string());
        Self::Bootstrap {
            interpreter,
            script,
            file_name,
            unbuffered: family == "python",
        }
    }

    /// Resolves the program and arguments, installing the bootstrap script
    /// when needed.
    async fn resolve(&self, definition: &FunctionDefinition) -> Result<(String, Vec<String>), RunnerError> {
        match self {
            Self::Command { program, args } => Ok((program.clone(), args.clone())),
            Self::Bootstrap {
                interpreter,
                script,
                file_name,
                unbuffered,
            } => {
                let bootstrap = install_bootstrap(file_name, script)
                    .await
                    .map_err(|e| RunnerError::Mount(format!("cannot install bootstrap: {e}")))?;
                let mut args = Vec::with_capacity(5);
                if *unbuffered {
                    args.push("-u".to_string());
                }
                args.push(bootstrap.display().to_string());
                args.push(definition.module_path().display().to_string());
                args.push(definition.handler.symbol.clone());
                args.push(definition.name.clone());
                Ok((interpreter.clone(), args))
            }
        }
    }
}

/// Writes `script` under the temp directory, replacing it atomically when the
/// content differs.
async fn install_bootstrap(file_name: &str, script: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join("localfaas-bootstrap");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(file_name);
    if tokio::fs::read_to_string(&path).await.ok().as_deref() == Some(script) {
        return Ok(path);
    }
    let staging = dir.join(format!("{file_name}.{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&staging, script).await?;
    tokio::fs::rename(&staging, &path).await?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Child process plumbing
// ---------------------------------------------------------------------------

/// Everything the child's I/O tasks report, in arrival order.
#[derive(Debug)]
enum ProcEvent {
    Reply(WorkerReply),
    Fatal(ErrorPayload),
    Malformed { line: String, reason: String },
    Exited(String),
}

struct Worker {
    tx: mpsc::UnboundedSender<String>,
    kill: Arc<Notify>,
    /// Set once the host stops the child on purpose.
    retired: Arc<AtomicBool>,
    exit: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl Worker {
    fn kill(self) {
        self.retired.store(true, Ordering::SeqCst);
        self.kill.notify_one();
    }

    /// Closes stdin and waits for the child to exit on its own, killing it
    /// after [`UNMOUNT_GRACE`].
    async fn shutdown(self, function: &str) {
        self.retired.store(true, Ordering::SeqCst);
        let Worker { tx, kill, exit, .. } = self;
        drop(tx);
        if let Some(exit) = exit {
            if tokio::time::timeout(UNMOUNT_GRACE, exit).await.is_err() {
                warn!(function, "worker process ignored stdin EOF, killing");
                kill.notify_one();
            }
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_stdout<R: AsyncRead + Unpin>(function: String, stdout: R, events: mpsc::UnboundedSender<ProcEvent>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                let _ = events.send(ProcEvent::Malformed {
                    line: String::new(),
                    reason: e.to_string(),
                });
                break;
            }
        };
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let event = match WorkerLine::from_stdout(line) {
            WorkerLine::Log(text) => {
                info!(target: HANDLER_TARGET, function = %function, "{text}");
                continue;
            }
            WorkerLine::Reply(reply) => ProcEvent::Reply(reply),
            WorkerLine::Error(payload) => ProcEvent::Fatal(payload),
            WorkerLine::Malformed { line, reason } => ProcEvent::Malformed { line, reason },
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(function: String, stderr: R, events: mpsc::UnboundedSender<ProcEvent>) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(Ok(line)) = lines.next().await {
        match WorkerLine::from_stderr(line.trim_end_matches('\r')) {
            WorkerLine::Error(payload) => {
                if events.send(ProcEvent::Fatal(payload)).is_err() {
                    break;
                }
            }
            WorkerLine::Log(text) if !text.is_empty() => {
                warn!(target: HANDLER_TARGET, function = %function, "{text}");
            }
            WorkerLine::Malformed { line, .. } => {
                warn!(target: HANDLER_TARGET, function = %function, "{line}");
            }
            _ => {}
        }
    }
}

async fn watch_exit(mut child: Child, kill: Arc<Notify>, events: mpsc::UnboundedSender<ProcEvent>) {
    tokio::select! {
        status = child.wait() => {
            let status = status.map_or_else(|e| e.to_string(), |s| s.to_string());
            let _ = events.send(ProcEvent::Exited(status));
        }
        () = kill.notified() => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "failed to kill worker process");
            }
        }
    }
}

/// After an exit during import, waits briefly for the error line the child
/// may have written just before exiting.
async fn drain_fatal(events: &mut mpsc::UnboundedReceiver<ProcEvent>) -> Option<ErrorPayload> {
    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ProcEvent::Fatal(payload) | ProcEvent::Reply(WorkerReply::Fatal { data: payload }))) => {
                return Some(payload)
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

struct Shared {
    definition: FunctionDefinition,
    launch: Launch,
    watch_sources: bool,
    worker: Mutex<Option<Worker>>,
    pending: PendingCalls,
    mounted: AtomicBool,
    hook: RwLock<Option<RunnerHook>>,
    lifecycle: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

/// Runner executing handlers in an interpreter subprocess.
pub struct ProcessRunner {
    shared: Arc<Shared>,
}

impl ProcessRunner {
    /// Runner for a Python or Ruby function, using the interpreter from
    /// `config.interpreter_overrides` when one is set for the runtime family.
    #[must_use]
    pub fn new(definition: FunctionDefinition, config: &EmulatorConfig) -> Self {
        let launch = Launch::for_runtime(&definition.runtime, config);
        Self::with_launch(definition, launch, config.watch_sources)
    }

    /// Runner whose child is `program args..`; the command must speak the
    /// wire protocol itself. Source watching is off.
    #[must_use]
    pub fn with_command(definition: FunctionDefinition, program: impl Into<String>, args: Vec<String>) -> Self {
        let launch = Launch::Command {
            program: program.into(),
            args,
        };
        Self::with_launch(definition, launch, false)
    }

    fn with_launch(definition: FunctionDefinition, launch: Launch, watch_sources: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                definition,
                launch,
                watch_sources,
                worker: Mutex::new(None),
                pending: PendingCalls::new(),
                mounted: AtomicBool::new(false),
                hook: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// OS process id of the current child, if one is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.shared.worker.lock().as_ref().and_then(|w| w.pid)
    }
}

impl Shared {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn emit(&self, event: RunnerEvent) {
        if let Some(hook) = self.hook.read().clone() {
            hook(event);
        }
    }

    /// Spawns a child, loads the handler and installs it as the current
    /// worker. Callers hold the lifecycle lock.
    async fn start(self: &Arc<Self>) -> Result<(), RunnerError> {
        let (program, args) = self.launch.resolve(&self.definition).await?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&self.definition.environment)
            .env("LOCALFAAS_FUNCTION_NAME", self.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.definition.base_dir.as_os_str().is_empty() {
            command.current_dir(&self.definition.base_dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::Mount(format!("failed to start {program}: {e}")))?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RunnerError::Mount("child stdio was not captured".into()));
        };

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (tx, lines) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());
        tokio::spawn(write_stdin(stdin, lines));
        tokio::spawn(read_stdout(self.name().to_string(), stdout, events_tx.clone()));
        tokio::spawn(read_stderr(self.name().to_string(), stderr, events_tx.clone()));
        let exit = tokio::spawn(watch_exit(child, Arc::clone(&kill), events_tx));

        let worker = Worker {
            tx,
            kill,
            retired: Arc::new(AtomicBool::new(false)),
            exit: Some(exit),
            pid,
        };
        let import = WorkerMessage::Import
            .to_line()
            .map_err(|e| RunnerError::Protocol(e.to_string()))?;
        let _ = worker.tx.send(import);

        let failure = loop {
            match events.recv().await {
                Some(ProcEvent::Reply(WorkerReply::Ready)) => break None,
                Some(ProcEvent::Fatal(payload) | ProcEvent::Reply(WorkerReply::Fatal { data: payload })) => {
                    break Some(RunnerError::Mount(payload.to_string()));
                }
                Some(ProcEvent::Malformed { line, reason }) => {
                    break Some(RunnerError::Protocol(format!("undecodable reply during import ({reason}): {line}")));
                }
                Some(ProcEvent::Reply(other)) => {
                    break Some(RunnerError::Protocol(format!("unexpected reply during import: {other:?}")));
                }
                Some(ProcEvent::Exited(status)) => {
                    let message = match drain_fatal(&mut events).await {
                        Some(payload) => payload.to_string(),
                        None => format!("{program} exited during import ({status})"),
                    };
                    break Some(RunnerError::Mount(message));
                }
                None => break Some(RunnerError::Mount("worker exited during import".into())),
            }
        };
        if let Some(err) = failure {
            worker.kill();
            return Err(err);
        }

        self.mounted.store(true, Ordering::SeqCst);
        tokio::spawn(supervise(Arc::downgrade(self), events, Arc::clone(&worker.retired), Arc::clone(&worker.kill)));
        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.kill();
        }
        debug!(function = %self.name(), ?pid, "worker process mounted");
        Ok(())
    }

    /// Respawns the child after a source change.
    async fn reload(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.mounted.load(Ordering::SeqCst) {
            return;
        }
        info!(function = %self.name(), "handler source changed, respawning worker");
        self.emit(RunnerEvent::Reloading);
        self.mounted.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            worker.kill();
        }
        self.pending.fail_all("worker reloading");

        let mounted = match self.start().await {
            Ok(()) => true,
            Err(e) => {
                warn!(function = %self.name(), error = %e, "reload failed");
                false
            }
        };
        self.emit(RunnerEvent::Reloaded { mounted });
    }

    fn ensure_watcher(self: &Arc<Self>) {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }
        match start_source_watcher(self) {
            Ok(watcher) => *slot = Some(watcher),
            Err(e) => warn!(function = %self.name(), error = %e, "source watching unavailable"),
        }
    }
}

/// Host side of a mounted child: routes replies and reports unexpected
/// termination.
async fn supervise(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<ProcEvent>,
    retired: Arc<AtomicBool>,
    kill: Arc<Notify>,
) {
    let event = loop {
        let Some(next) = events.recv().await else {
            break RunnerEvent::Exited;
        };
        match next {
            ProcEvent::Reply(WorkerReply::Fatal { data }) | ProcEvent::Fatal(data) => {
                break RunnerEvent::Uncaught(data.to_string());
            }
            ProcEvent::Reply(WorkerReply::Ready) => {
                warn!("unexpected ready reply from mounted worker");
            }
            ProcEvent::Reply(reply) => {
                let Some(shared) = shared.upgrade() else { return };
                shared.pending.dispatch(reply);
            }
            ProcEvent::Malformed { line, reason } => {
                break RunnerEvent::Protocol(format!("undecodable reply ({reason}): {line}"));
            }
            ProcEvent::Exited(status) => {
                debug!(%status, "worker process exited");
                break RunnerEvent::Exited;
            }
        }
    };

    // Retired children were stopped by the host; nothing to report.
    if retired.swap(true, Ordering::SeqCst) {
        return;
    }
    kill.notify_one();
    let Some(shared) = shared.upgrade() else { return };
    shared.mounted.store(false, Ordering::SeqCst);
    warn!(function = %shared.name(), ?event, "worker process terminated");
    shared.pending.fail_all("worker terminated");
    shared.emit(event);
}

fn start_source_watcher(shared: &Arc<Shared>) -> notify::Result<RecommendedWatcher> {
    let module = shared.definition.module_path();
    let dir = match module.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = module.file_name().map(ToOwned::to_owned);

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let touches_module = event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
            if touches_module && (event.kind.is_modify() || event.kind.is_create()) {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(Path::new(&dir), RecursiveMode::NonRecursive)?;

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            debounce(&mut rx).await;
            let Some(shared) = weak.upgrade() else { break };
            shared.reload().await;
        }
    });
    debug!(function = %shared.name(), dir = %dir.display(), "watching handler source");
    Ok(watcher)
}

/// Swallows events until none arrive for [`RELOAD_DEBOUNCE`].
async fn debounce(rx: &mut mpsc::UnboundedReceiver<()>) {
    let sleep = tokio::time::sleep(RELOAD_DEBOUNCE);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => break,
            next = rx.recv() => {
                if next.is_none() {
                    break;
                }
                sleep.as_mut().reset(Instant::now() + RELOAD_DEBOUNCE);
            }
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn mount(&self) -> Result<(), RunnerError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.shared.start().await?;
        if self.shared.watch_sources {
            self.shared.ensure_watcher();
        }
        Ok(())
    }

    async fn unmount(&self, force: bool) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let Some(worker) = self.shared.worker.lock().take() else {
            return;
        };
        self.shared.mounted.store(false, Ordering::SeqCst);
        if force {
            worker.kill();
        } else {
            worker.shutdown(self.shared.name()).await;
        }
        self.shared.pending.fail_all("runner unmounted");
        debug!(function = %self.shared.name(), force, "worker process unmounted");
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, RunnerError> {
        let tx = {
            let worker = self.shared.worker.lock();
            match worker.as_ref() {
                Some(w) if self.shared.mounted.load(Ordering::SeqCst) => w.tx.clone(),
                _ => return Err(RunnerError::NotMounted),
            }
        };

        let request_id = request.request_id.clone();
        let line = match (WorkerMessage::Exec {
            request_id: request_id.clone(),
            event: request.event,
            context: request.context,
        })
        .to_line()
        {
            Ok(line) => line,
            Err(e) => return Err(RunnerError::Protocol(format!("cannot encode invocation: {e}"))),
        };

        let rx = self.shared.pending.register(&request_id);
        if tx.send(line).is_err() {
            self.shared.pending.forget(&request_id);
            return Err(RunnerError::NotMounted);
        }
        rx.await
            .unwrap_or_else(|_| Err(RunnerError::Protocol("worker dropped the invocation".into())))
    }

    fn on_complete(&self, request_id: &str, timed_out: bool) {
        self.shared.pending.forget(request_id);
        if timed_out {
            debug!(function = %self.shared.name(), request_id, "timed-out call keeps running in the worker");
        }
        let Ok(line) = (WorkerMessage::Complete {
            request_id: request_id.to_string(),
            timed_out,
        })
        .to_line() else {
            return;
        };
        if let Some(worker) = self.shared.worker.lock().as_ref() {
            let _ = worker.tx.send(line);
        }
    }

    fn is_mounted(&self) -> bool {
        self.shared.mounted.load(Ordering::SeqCst)
    }

    fn set_event_hook(&self, hook: RunnerHook) {
        *self.shared.hook.write() = Some(hook);
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if let Some(worker) = self.shared.worker.lock().take() {
            worker.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use localfaas_core::{HandlerRef, InvocationContext, TriggerInfo, TriggerKind};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;

    fn definition(runtime: &str, handler: &str) -> FunctionDefinition {
        FunctionDefinition::new(
            "proc",
            Runtime::parse(runtime),
            HandlerRef::try_from(handler.to_string()).unwrap(),
        )
    }

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::with_command(
            definition("python3.12", "handler.handler"),
            "sh",
            vec!["-c".into(), script.into()],
        )
    }

    fn request(id: &str, event: Value) -> InvocationRequest {
        let deadline = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap() + 60_000;
        InvocationRequest {
            request_id: id.into(),
            function: "proc".into(),
            event,
            trigger: TriggerInfo::new(TriggerKind::Invoke),
            context: InvocationContext {
                function_name: "proc".into(),
                function_version: "$LATEST".into(),
                invoked_function_arn: String::new(),
                memory_limit_in_mb: 128,
                aws_request_id: id.into(),
                deadline_ms: deadline,
                client_context: None,
            },
            timeout: None,
        }
    }

    fn recording_hook(runner: &ProcessRunner) -> Arc<Mutex<Vec<RunnerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        runner.set_event_hook(Arc::new(move |event| sink.lock().push(event)));
        events
    }

    async fn wait_for(events: &Arc<Mutex<Vec<RunnerEvent>>>, count: usize) {
        for _ in 0..200 {
            if events.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    const READY: &str = r#"read line; printf '\n__|response|__{"channel":"ready"}\n'; "#;

    #[tokio::test]
    async fn framed_reply_resolves_invocation() {
        let runner = sh(&format!(
            r#"{READY}read line; echo 'log from handler'; printf '__|response|__{{"channel":"return","requestId":"r-1","data":{{"ok":true}}}}\n'; read line"#
        ));
        runner.mount().await.unwrap();
        assert!(runner.is_mounted());
        assert!(runner.pid().is_some());

        let out = runner.invoke(request("r-1", json!({}))).await.unwrap();
        assert_eq!(out, InvocationOutput::Value(json!({ "ok": true })));
        runner.unmount(false).await;
        assert!(!runner.is_mounted());
    }

    #[tokio::test]
    async fn malformed_reply_tears_down_worker() {
        let runner = sh(&format!(
            r#"{READY}read line; printf '__|response|__{{"channel":"ret\n'; read line"#
        ));
        let events = recording_hook(&runner);
        runner.mount().await.unwrap();

        let err = runner.invoke(request("r-1", json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
        wait_for(&events, 1).await;
        assert!(matches!(events.lock().first(), Some(RunnerEvent::Protocol(_))));
        assert!(!runner.is_mounted());
    }

    #[tokio::test]
    async fn import_error_fails_mount() {
        let runner = sh(
            r#"read line; echo '__|error|__{"errorType":"ImportError","errorMessage":"no module named x"}' >&2; exit 1"#,
        );
        match runner.mount().await {
            Err(RunnerError::Mount(message)) => assert!(message.contains("no module named x"), "{message}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!runner.is_mounted());
    }

    #[tokio::test]
    async fn unexpected_exit_fails_pending_calls() {
        let runner = sh(&format!("{READY}read line; exit 3"));
        let events = recording_hook(&runner);
        runner.mount().await.unwrap();

        let err = runner.invoke(request("r-1", json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(m) if m == "worker terminated"));
        wait_for(&events, 1).await;
        assert_eq!(events.lock().first(), Some(&RunnerEvent::Exited));
    }

    #[tokio::test]
    async fn intentional_unmount_is_not_reported() {
        let runner = sh(&format!("{READY}read line"));
        let events = recording_hook(&runner);
        runner.mount().await.unwrap();
        runner.unmount(true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.lock().is_empty());
        assert!(matches!(
            runner.invoke(request("r-1", json!({}))).await,
            Err(RunnerError::NotMounted)
        ));
    }

    #[tokio::test]
    async fn python_handler_end_to_end() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("handler.py"),
            "import os\n\
             def handler(event, context):\n\
             \x20   print('hello from python')\n\
             \x20   return {'echo': event['name'], 'fn': context.function_name, 'stage': os.environ.get('STAGE'), 'live': context.get_remaining_time_in_millis() > 0}\n\
             def boom(event, context):\n\
             \x20   raise ValueError('bad input')\n",
        )
        .unwrap();

        let mut config = EmulatorConfig::default();
        config.watch_sources = false;
        let mut def = definition("python3.12", "handler.handler");
        def.base_dir = dir.path().to_path_buf();
        def.environment.insert("STAGE".into(), "test".into());
        let runner = ProcessRunner::new(def, &config);
        runner.mount().await.unwrap();

        let out = runner.invoke(request("r-1", json!({ "name": "ada" }))).await.unwrap();
        assert_eq!(
            out,
            InvocationOutput::Value(json!({ "echo": "ada", "fn": "proc", "stage": "test", "live": true }))
        );
        runner.unmount(false).await;

        let mut def = definition("python3.12", "handler.boom");
        def.base_dir = dir.path().to_path_buf();
        let runner = ProcessRunner::new(def, &config);
        runner.mount().await.unwrap();
        match runner.invoke(request("r-2", json!({}))).await {
            Err(RunnerError::Handler(payload)) => {
                assert_eq!(payload.error_type, "ValueError");
                assert_eq!(payload.error_message, "bad input");
                assert!(payload.trace.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        runner.unmount(true).await;
    }

    #[tokio::test]
    async fn python_missing_symbol_fails_mount() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("handler.py"), "x = 1\n").unwrap();
        let mut config = EmulatorConfig::default();
        config.watch_sources = false;
        let mut def = definition("python3", "handler.handler");
        def.base_dir = dir.path().to_path_buf();
        let runner = ProcessRunner::new(def, &config);
        assert!(matches!(runner.mount().await, Err(RunnerError::Mount(m)) if m.contains("AttributeError")));
    }

    #[tokio::test]
    async fn python_source_change_respawns_worker() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("handler.py");
        std::fs::write(&module, "def handler(event, context):\n    return 1\n").unwrap();

        let mut config = EmulatorConfig::default();
        config.watch_sources = true;
        let mut def = definition("python3", "handler.handler");
        def.base_dir = dir.path().to_path_buf();
        let runner = ProcessRunner::new(def, &config);
        let events = recording_hook(&runner);
        runner.mount().await.unwrap();
        assert_eq!(runner.invoke(request("r-1", json!({}))).await.unwrap(), InvocationOutput::Value(json!(1)));

        std::fs::write(&module, "def handler(event, context):\n    return 2\n").unwrap();
        wait_for(&events, 2).await;
        assert!(events
            .lock()
            .starts_with(&[RunnerEvent::Reloading, RunnerEvent::Reloaded { mounted: true }]));
        assert_eq!(runner.invoke(request("r-2", json!({}))).await.unwrap(), InvocationOutput::Value(json!(2)));
        runner.unmount(true).await;
    }
}
