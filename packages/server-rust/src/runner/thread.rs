//! In-process runner: executes Rhai handler scripts on a dedicated OS thread.
//!
//! The host and the worker thread speak the runner wire protocol over a pair
//! of channels (crossbeam into the worker, tokio back out). Invocations are
//! executed one at a time by the worker but multiplexed by request id on the
//! host side, so any number of callers may await the same runner.
//!
//! Handler scripts see the event and context as their arguments, plus:
//!
//! - `env(name)`: environment variable from the function definition, or `()`
//! - `remaining_time_ms()`: milliseconds left before the deadline
//! - `succeed(value)` / `fail(value)`: explicit outcome, overrides the return
//! - `stream_write(text)` / `stream_content_type(ct)`: streamed response
//! - `print` / `debug`: routed to `tracing` under `localfaas::handler`

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use localfaas_core::{ErrorPayload, FunctionDefinition, StreamChunk, WorkerMessage, WorkerReply};
use parking_lot::{Mutex, RwLock};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::pending::PendingCalls;
use super::{Runner, RunnerError, RunnerEvent, RunnerHook, HANDLER_TARGET};
use crate::invocation::{InvocationOutput, InvocationRequest};

/// Operations between two checks of the abort flags in the progress hook.
const ABORT_CHECK_INTERVAL: u64 = 512;

/// How long a graceful unmount waits for queued invocations to drain.
const UNMOUNT_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

struct Worker {
    tx: Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Stops the worker without waiting; the thread exits once its current
    /// script observes the shutdown flag.
    fn kill(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Runner executing Rhai scripts on a worker thread.
pub struct ThreadRunner {
    definition: FunctionDefinition,
    worker: Mutex<Option<Worker>>,
    pending: Arc<PendingCalls>,
    aborted: Arc<Mutex<HashSet<String>>>,
    mounted: Arc<AtomicBool>,
    hook: Arc<RwLock<Option<RunnerHook>>>,
}

impl ThreadRunner {
    #[must_use]
    pub fn new(definition: FunctionDefinition) -> Self {
        Self {
            definition,
            worker: Mutex::new(None),
            pending: Arc::new(PendingCalls::new()),
            aborted: Arc::new(Mutex::new(HashSet::new())),
            mounted: Arc::new(AtomicBool::new(false)),
            hook: Arc::new(RwLock::new(None)),
        }
    }

    fn spawn_worker(&self) -> Result<(Worker, mpsc::UnboundedReceiver<WorkerReply>), RunnerError> {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext {
            function: self.definition.name.clone(),
            module: self.definition.module_path(),
            symbol: self.definition.handler.symbol.clone(),
            environment: Arc::new(self.definition.environment.clone()),
            aborted: Arc::clone(&self.aborted),
            shutdown: Arc::clone(&shutdown),
        };
        let thread = std::thread::Builder::new()
            .name(format!("rhai-{}", self.definition.name))
            .spawn(move || {
                let fatal_tx = reply_tx.clone();
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    worker_main(&ctx, &rx, &reply_tx);
                }));
                if outcome.is_err() {
                    let _ = fatal_tx.send(WorkerReply::Fatal {
                        data: ErrorPayload::new("Runtime.WorkerPanic", "worker thread panicked"),
                    });
                }
            })?;

        Ok((
            Worker {
                tx,
                thread: Some(thread),
                reader: None,
                shutdown,
            },
            reply_rx,
        ))
    }
}

#[async_trait]
impl Runner for ThreadRunner {
    async fn mount(&self) -> Result<(), RunnerError> {
        let (mut worker, mut replies) = self.spawn_worker()?;
        worker
            .tx
            .send(WorkerMessage::Import)
            .map_err(|_| RunnerError::Mount("worker exited before import".into()))?;

        match replies.recv().await {
            Some(WorkerReply::Ready) => {}
            Some(WorkerReply::Fatal { data }) => {
                worker.kill();
                return Err(RunnerError::Mount(data.to_string()));
            }
            Some(other) => {
                worker.kill();
                return Err(RunnerError::Protocol(format!(
                    "unexpected reply during import: {other:?}"
                )));
            }
            None => return Err(RunnerError::Mount("worker exited during import".into())),
        }

        worker.reader = Some(tokio::spawn(read_replies(
            self.definition.name.clone(),
            replies,
            Arc::clone(&self.pending),
            Arc::clone(&self.mounted),
            Arc::clone(&self.hook),
        )));
        self.mounted.store(true, Ordering::SeqCst);
        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.kill();
        }
        debug!(function = %self.definition.name, "rhai worker mounted");
        Ok(())
    }

    async fn unmount(&self, force: bool) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.mounted.store(false, Ordering::SeqCst);

        if force {
            worker.kill();
        } else {
            let Worker {
                tx,
                thread,
                reader,
                shutdown,
            } = worker;
            // Closing the inbound channel lets the worker drain queued calls.
            drop(tx);
            if let Some(thread) = thread {
                let join = tokio::task::spawn_blocking(move || {
                    let _ = thread.join();
                });
                if tokio::time::timeout(UNMOUNT_GRACE, join).await.is_err() {
                    warn!(function = %self.definition.name, "worker did not drain in time, aborting");
                    shutdown.store(true, Ordering::SeqCst);
                }
            }
            if let Some(mut reader) = reader {
                if tokio::time::timeout(UNMOUNT_GRACE, &mut reader).await.is_err() {
                    reader.abort();
                }
            }
        }

        self.pending.fail_all("runner unmounted");
        self.aborted.lock().clear();
        debug!(function = %self.definition.name, force, "rhai worker unmounted");
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, RunnerError> {
        let tx = self
            .worker
            .lock()
            .as_ref()
            .map(|w| w.tx.clone())
            .ok_or(RunnerError::NotMounted)?;

        let request_id = request.request_id.clone();
        let rx = self.pending.register(&request_id);

        let message = WorkerMessage::Exec {
            request_id: request_id.clone(),
            event: request.event,
            context: request.context,
        };
        if tx.send(message).is_err() {
            self.pending.forget(&request_id);
            return Err(RunnerError::NotMounted);
        }

        rx.await
            .unwrap_or_else(|_| Err(RunnerError::Protocol("worker dropped the invocation".into())))
    }

    fn on_complete(&self, request_id: &str, timed_out: bool) {
        self.pending.forget(request_id);
        if timed_out {
            self.aborted.lock().insert(request_id.to_string());
        }
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.tx.send(WorkerMessage::Complete {
                request_id: request_id.to_string(),
                timed_out,
            });
        }
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn set_event_hook(&self, hook: RunnerHook) {
        *self.hook.write() = Some(hook);
    }
}

impl Drop for ThreadRunner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.kill();
        }
    }
}

/// Host side: routes worker replies to their pending invocation.
async fn read_replies(
    function: String,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    pending: Arc<PendingCalls>,
    mounted: Arc<AtomicBool>,
    hook: Arc<RwLock<Option<RunnerHook>>>,
) {
    let event = loop {
        let Some(reply) = replies.recv().await else {
            break RunnerEvent::Exited;
        };
        match reply {
            WorkerReply::Fatal { data } => break RunnerEvent::Uncaught(data.to_string()),
            WorkerReply::Ready => {
                warn!(function = %function, "unexpected ready reply from mounted worker");
            }
            reply => {
                pending.dispatch(reply);
            }
        }
    };

    // An unmount clears the flag first; only unexpected exits are reported.
    if !mounted.swap(false, Ordering::SeqCst) {
        return;
    }
    warn!(function = %function, ?event, "rhai worker terminated");
    pending.fail_all("worker terminated");
    if let Some(hook) = hook.read().clone() {
        hook(event);
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

struct WorkerContext {
    function: String,
    module: PathBuf,
    symbol: String,
    environment: Arc<BTreeMap<String, String>>,
    aborted: Arc<Mutex<HashSet<String>>>,
    shutdown: Arc<AtomicBool>,
}

/// Explicit outcome recorded by `succeed` / `fail`.
enum Explicit {
    Succeed(Value),
    Fail(ErrorPayload),
}

#[derive(Default)]
struct CallState {
    request_id: Option<String>,
    deadline_ms: u64,
    explicit: Option<Explicit>,
    streamed: bool,
}

struct Loaded {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    arity: usize,
}

fn worker_main(ctx: &WorkerContext, rx: &Receiver<WorkerMessage>, replies: &mpsc::UnboundedSender<WorkerReply>) {
    let state = Arc::new(Mutex::new(CallState::default()));
    let mut loaded: Option<Loaded> = None;

    for message in rx {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match message {
            WorkerMessage::Import => {
                let reply = match load(ctx, &state, replies) {
                    Ok(l) => {
                        loaded = Some(l);
                        WorkerReply::Ready
                    }
                    Err(data) => WorkerReply::Fatal { data },
                };
                if replies.send(reply).is_err() {
                    break;
                }
            }
            WorkerMessage::Exec {
                request_id,
                event,
                context,
            } => {
                if ctx.aborted.lock().remove(&request_id) {
                    debug!(request_id, "skipping invocation aborted before it started");
                    continue;
                }
                let Some(l) = loaded.as_mut() else {
                    let _ = replies.send(WorkerReply::Fatal {
                        data: ErrorPayload::new("Runtime.ProtocolError", "exec before import"),
                    });
                    break;
                };
                {
                    let mut s = state.lock();
                    *s = CallState {
                        request_id: Some(request_id.clone()),
                        deadline_ms: context.deadline_ms,
                        ..CallState::default()
                    };
                }
                let reply = execute(l, &ctx.symbol, &request_id, &event, &context, &state);
                ctx.aborted.lock().remove(&request_id);
                *state.lock() = CallState::default();
                if replies.send(reply).is_err() {
                    break;
                }
            }
            WorkerMessage::Complete {
                request_id,
                timed_out,
            } => {
                if timed_out {
                    ctx.aborted.lock().remove(&request_id);
                    debug!(request_id, "invocation timed out on the host");
                }
            }
        }
    }
}

fn load(
    ctx: &WorkerContext,
    state: &Arc<Mutex<CallState>>,
    replies: &mpsc::UnboundedSender<WorkerReply>,
) -> Result<Loaded, ErrorPayload> {
    let engine = build_engine(ctx, state, replies);
    let ast = engine.compile_file(ctx.module.clone()).map_err(|e| {
        ErrorPayload::new(
            "Runtime.ImportModuleError",
            format!("cannot load {}: {e}", ctx.module.display()),
        )
    })?;
    let arity = ast
        .iter_functions()
        .find(|f| f.name == ctx.symbol)
        .map(|f| f.params.len())
        .ok_or_else(|| {
            ErrorPayload::new(
                "Runtime.HandlerNotFound",
                format!("{} is undefined or not exported", ctx.symbol),
            )
        })?;

    let mut scope = Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ErrorPayload::new("Runtime.ImportModuleError", e.to_string()))?;
    Ok(Loaded {
        engine,
        ast,
        scope,
        arity,
    })
}

fn build_engine(
    ctx: &WorkerContext,
    state: &Arc<Mutex<CallState>>,
    replies: &mpsc::UnboundedSender<WorkerReply>,
) -> Engine {
    let mut engine = Engine::new();

    let function = ctx.function.clone();
    engine.on_print(move |text| info!(target: HANDLER_TARGET, function = %function, "{text}"));
    let function = ctx.function.clone();
    engine.on_debug(move |text, _source, pos| {
        debug!(target: HANDLER_TARGET, function = %function, %pos, "{text}");
    });

    let (aborted, shutdown, s) = (Arc::clone(&ctx.aborted), Arc::clone(&ctx.shutdown), Arc::clone(state));
    engine.on_progress(move |ops| {
        if ops % ABORT_CHECK_INTERVAL != 0 {
            return None;
        }
        if shutdown.load(Ordering::Relaxed) {
            return Some(Dynamic::UNIT);
        }
        let current = s.lock().request_id.clone();
        match current {
            Some(id) if aborted.lock().contains(&id) => Some(Dynamic::UNIT),
            _ => None,
        }
    });

    let env = Arc::clone(&ctx.environment);
    engine.register_fn("env", move |name: &str| -> Dynamic {
        env.get(name).map_or(Dynamic::UNIT, |v| Dynamic::from(v.clone()))
    });

    let s = Arc::clone(state);
    engine.register_fn("remaining_time_ms", move || -> i64 {
        let deadline = i64::try_from(s.lock().deadline_ms).unwrap_or(i64::MAX);
        (deadline - chrono::Utc::now().timestamp_millis()).max(0)
    });

    let s = Arc::clone(state);
    engine.register_fn("succeed", move |value: Dynamic| {
        let value = rhai::serde::from_dynamic::<Value>(&value).unwrap_or(Value::Null);
        s.lock().explicit = Some(Explicit::Succeed(value));
    });

    let s = Arc::clone(state);
    engine.register_fn("fail", move |value: Dynamic| {
        let value = rhai::serde::from_dynamic::<Value>(&value).unwrap_or(Value::Null);
        s.lock().explicit = Some(Explicit::Fail(ErrorPayload::from_value(&value)));
    });

    let (s, tx) = (Arc::clone(state), replies.clone());
    engine.register_fn("stream_write", move |text: &str| {
        send_stream(&s, &tx, StreamChunk::Write {
            chunk: text.to_string(),
        });
    });

    let (s, tx) = (Arc::clone(state), replies.clone());
    engine.register_fn("stream_content_type", move |value: &str| {
        send_stream(&s, &tx, StreamChunk::ContentType {
            value: value.to_string(),
        });
    });

    engine
}

fn send_stream(
    state: &Mutex<CallState>,
    replies: &mpsc::UnboundedSender<WorkerReply>,
    data: StreamChunk,
) {
    let mut s = state.lock();
    let Some(request_id) = s.request_id.clone() else {
        warn!("stream output outside an invocation is dropped");
        return;
    };
    s.streamed = true;
    let _ = replies.send(WorkerReply::Stream { request_id, data });
}

fn execute(
    loaded: &mut Loaded,
    symbol: &str,
    request_id: &str,
    event: &Value,
    context: &localfaas_core::InvocationContext,
    state: &Mutex<CallState>,
) -> WorkerReply {
    let fail = |data| WorkerReply::Fail {
        request_id: request_id.to_string(),
        data,
    };

    let args = match (rhai::serde::to_dynamic(event), rhai::serde::to_dynamic(context)) {
        (Ok(event), Ok(context)) => {
            let mut args = vec![event, context];
            args.truncate(loaded.arity);
            args
        }
        (Err(e), _) | (_, Err(e)) => {
            return fail(ErrorPayload::new("Runtime.InvalidEvent", e.to_string()));
        }
    };

    let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
    let result = loaded.engine.call_fn_with_options::<Dynamic>(
        options,
        &mut loaded.scope,
        &loaded.ast,
        symbol,
        args,
    );

    let mut s = state.lock();
    match (result, s.explicit.take()) {
        (_, Some(Explicit::Fail(data))) => fail(data),
        (Err(err), _) => fail(script_error(*err)),
        (Ok(_), Some(Explicit::Succeed(data))) => WorkerReply::Succeed {
            request_id: request_id.to_string(),
            data,
        },
        (Ok(_), None) if s.streamed => WorkerReply::Stream {
            request_id: request_id.to_string(),
            data: StreamChunk::End,
        },
        (Ok(value), None) => match rhai::serde::from_dynamic::<Value>(&value) {
            Ok(data) => WorkerReply::Return {
                request_id: request_id.to_string(),
                data,
            },
            Err(e) => fail(ErrorPayload::new("Runtime.InvalidResponse", e.to_string())),
        },
    }
}

fn script_error(err: EvalAltResult) -> ErrorPayload {
    match err {
        EvalAltResult::ErrorRuntime(value, pos) => {
            let value = rhai::serde::from_dynamic::<Value>(&value).unwrap_or(Value::Null);
            ErrorPayload::from_value(&value).with_trace(vec![format!("at {pos}")])
        }
        EvalAltResult::ErrorTerminated(_, _) => {
            ErrorPayload::new("Runtime.Terminated", "invocation aborted")
        }
        other => ErrorPayload::new("Runtime.ScriptError", other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
