//! In-flight invocation table shared by runner backends.
//!
//! Each entry is keyed by request id and resolved exactly once, either by the
//! worker's reply or by a teardown that fails every outstanding call.

use dashmap::DashMap;
use localfaas_core::{StreamChunk, WorkerReply};
use tokio::sync::oneshot;
use tracing::warn;

use super::RunnerError;
use crate::invocation::InvocationOutput;

pub(crate) type CallResult = Result<InvocationOutput, RunnerError>;

struct PendingCall {
    reply: oneshot::Sender<CallResult>,
    content_type: Option<String>,
    body: Option<String>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<String, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns the receiver its result arrives on.
    pub(crate) fn register(&self, request_id: &str) -> oneshot::Receiver<CallResult> {
        let (reply, rx) = oneshot::channel();
        self.calls.insert(
            request_id.to_string(),
            PendingCall {
                reply,
                content_type: None,
                body: None,
            },
        );
        rx
    }

    /// Forgets a call without resolving it (the caller stopped waiting).
    pub(crate) fn forget(&self, request_id: &str) {
        self.calls.remove(request_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Applies one per-invocation worker reply. Returns `false` for replies
    /// that carry no request id.
    pub(crate) fn dispatch(&self, reply: WorkerReply) -> bool {
        match reply {
            WorkerReply::Return { request_id, data } | WorkerReply::Succeed { request_id, data } => {
                self.resolve(&request_id, Ok(InvocationOutput::Value(data)));
            }
            WorkerReply::Fail { request_id, data } => {
                self.resolve(&request_id, Err(RunnerError::Handler(data)));
            }
            WorkerReply::Stream { request_id, data } => self.stream(&request_id, data),
            WorkerReply::Ready | WorkerReply::Fatal { .. } => return false,
        }
        true
    }

    fn resolve(&self, request_id: &str, result: CallResult) {
        match self.calls.remove(request_id) {
            Some((_, call)) => {
                let _ = call.reply.send(result);
            }
            None => {
                warn!(request_id, "discarding reply for an invocation that already completed");
            }
        }
    }

    fn stream(&self, request_id: &str, chunk: StreamChunk) {
        match chunk {
            StreamChunk::End => {
                if let Some((_, call)) = self.calls.remove(request_id) {
                    let _ = call.reply.send(Ok(InvocationOutput::Streamed {
                        content_type: call.content_type,
                        body: call.body.unwrap_or_default(),
                    }));
                }
            }
            StreamChunk::Write { chunk } => {
                if let Some(mut call) = self.calls.get_mut(request_id) {
                    call.body.get_or_insert_with(String::new).push_str(&chunk);
                } else {
                    warn!(request_id, "dropping stream output of a completed invocation");
                }
            }
            StreamChunk::ContentType { value } => {
                if let Some(mut call) = self.calls.get_mut(request_id) {
                    call.content_type = Some(value);
                }
            }
        }
    }

    /// Fails every outstanding call with a protocol error.
    pub(crate) fn fail_all(&self, reason: &str) {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.reply.send(Err(RunnerError::Protocol(reason.to_string())));
            }
        }
    }
}
