//! The per-worker dispatch loop.
//!
//! Receive → reassemble → decode → dispatch against the registry and
//! backend → encode → chunked reply. A worker never lets one bad message
//! take down the pool: every failure that can be expressed as `ok:false`
//! is replied as such, and the worker moves on to the next message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{Bus, Message, Subscription};
use crate::protocol::chunk::{reassemble, send_reply};
use crate::protocol::{
    random_token, BucketRef, CloseResult, ListResult, LoadResult, MkdirResult, OpKind, OpenResult,
    Operation, OperationResult, RemoveResult, SaveResult, StatResult, HEADER_MSGID, HEADER_OP,
};
use crate::registry::ClientRegistry;
use crate::backend::FsBackend;
use crate::Error;

/// Collaborators a worker needs to dispatch one message. Cheap to clone:
/// everything inside is `Arc`-backed or itself a handle type.
#[derive(Clone)]
pub struct WorkerContext {
    pub bus: Arc<dyn Bus>,
    pub registry: Arc<ClientRegistry>,
    pub backend: Arc<FsBackend>,
    pub job_timeout: Duration,
}

/// Run the receive loop until `dying` is triggered or the subscription
/// closes.
pub async fn run(
    ctx: WorkerContext,
    mut sub: Box<dyn Subscription>,
    dying: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = dying.cancelled() => break,
            msg = sub.next(Duration::from_secs(3600)) => {
                match msg {
                    Ok(Some(msg)) => handle_one(&ctx, msg).await,
                    Ok(None) => break,
                    Err(Error::Timeout) => continue,
                    Err(e) => {
                        error!(error = %e, "worker's subscription failed, exiting");
                        break;
                    }
                }
            }
        }
    }
    let _ = sub.unsubscribe().await;
}

/// Handle a single command message end to end. One deadline covers the
/// whole transaction: reassembly and the reply both draw down the same
/// clock rather than each getting a fresh `job_timeout`.
async fn handle_one(ctx: &WorkerContext, msg: Message) {
    let limit = crate::protocol::chunk::chunk_limit(ctx.bus.max_payload());
    let deadline_at = Instant::now() + ctx.job_timeout;

    let whole = match reassemble(ctx.bus.as_ref(), msg, remaining(deadline_at)).await {
        Ok(whole) => whole,
        Err(e) if !e.is_reply_worthy() => {
            debug!("job deadline or cancellation fired during reassembly; dropping transaction");
            return;
        }
        Err(e) => {
            warn!(error = %e, "reassembly failed");
            return;
        }
    };

    let Some(op_header) = whole.header(HEADER_OP) else {
        warn!("message missing {HEADER_OP} header");
        return;
    };
    let Some(kind) = OpKind::from_header_value(op_header) else {
        // Scenario 6: unknown op. Policy: no reply, no state change.
        warn!(op = op_header, "unknown operation, dropping");
        return;
    };

    let result = match Operation::decode(kind, &whole.body) {
        Ok(op) => dispatch(ctx, op).await,
        Err(e) => {
            warn!(error = %e, "operation decode failed");
            decode_failure_result(kind)
        }
    };

    let body = match result.encode() {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to encode operation result, dropping reply");
            return;
        }
    };

    let reply = Message::new("").set_header(HEADER_MSGID, random_token()).with_body(body);
    if let Err(e) = send_reply(ctx.bus.as_ref(), &whole, reply, limit, remaining(deadline_at)).await {
        // Bus error on reply is unrecoverable for this worker; WPL replaces it.
        error!(error = %e, "failed to send reply, worker exiting");
    }
}

/// Time left until `deadline_at`, floored at zero rather than going negative.
fn remaining(deadline_at: Instant) -> Duration {
    deadline_at.saturating_duration_since(Instant::now())
}

fn decode_failure_result(kind: OpKind) -> OperationResult {
    match kind {
        OpKind::Open => OperationResult::Open(OpenResult { ok: false, client_id: None }),
        OpKind::Stat => OperationResult::Stat(StatResult { ok: false, name: String::new(), size: 0 }),
        OpKind::Mkdir => OperationResult::Mkdir(MkdirResult { ok: false }),
        OpKind::Save => OperationResult::Save(SaveResult { ok: false }),
        OpKind::List => OperationResult::List(ListResult { ok: false, entries: Vec::new() }),
        OpKind::Load => OperationResult::Load(LoadResult { ok: false, data: Vec::new() }),
        OpKind::Remove => OperationResult::Remove(RemoveResult { ok: false }),
        OpKind::Close => OperationResult::Close(CloseResult { ok: false }),
    }
}

/// Resolve a `BucketRef` to a bucket name through the client registry when
/// it names a `client_id`.
fn resolve_bucket(ctx: &WorkerContext, bucket_ref: &BucketRef) -> crate::Result<String> {
    match bucket_ref {
        BucketRef::Bucket(name) => Ok(name.clone()),
        BucketRef::ClientId(id) => ctx.registry.find(id).map(|session| session.bucket),
    }
}

async fn dispatch(ctx: &WorkerContext, op: Operation) -> OperationResult {
    let kind = op.kind();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || dispatch_blocking(&ctx, op))
        .await
        .unwrap_or_else(|_| decode_failure_result(kind))
}

/// The actual per-op backend calls. Run inside `spawn_blocking`.
fn dispatch_blocking(ctx: &WorkerContext, op: Operation) -> OperationResult {
    match op {
        Operation::Open(req) => match ctx.backend.stat(&req.bucket) {
            Ok(_) => {
                let session = ctx.registry.create(req.bucket);
                OperationResult::Open(OpenResult { ok: true, client_id: Some(session.client_id) })
            }
            Err(_) => OperationResult::Open(OpenResult { ok: false, client_id: None }),
        },
        Operation::Stat(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => match ctx.backend.stat(&format!("{bucket}/{}", req.filename)) {
                Ok(stat) => OperationResult::Stat(StatResult { ok: true, name: stat.name, size: stat.size }),
                Err(_) => OperationResult::Stat(StatResult { ok: false, name: String::new(), size: 0 }),
            },
            Err(_) => OperationResult::Stat(StatResult { ok: false, name: String::new(), size: 0 }),
        },
        Operation::Mkdir(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => {
                let ok = ctx.backend.mkdir(&format!("{bucket}/{}", req.dir)).is_ok();
                OperationResult::Mkdir(MkdirResult { ok })
            }
            Err(_) => OperationResult::Mkdir(MkdirResult { ok: false }),
        },
        Operation::Save(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => {
                let rel = format!("{bucket}/{}/{}", req.dir, req.name);
                let ok = matches!(ctx.backend.save(&rel, &req.data), Ok(written) if written == req.filesize);
                OperationResult::Save(SaveResult { ok })
            }
            Err(_) => OperationResult::Save(SaveResult { ok: false }),
        },
        Operation::List(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => match ctx.backend.list(&format!("{bucket}/{}", req.base_dir), req.recurse) {
                Ok(entries) => OperationResult::List(ListResult {
                    ok: true,
                    entries: entries
                        .into_iter()
                        .map(|e| crate::protocol::FileInfo { name: e.name, size: e.size })
                        .collect(),
                }),
                Err(_) => OperationResult::List(ListResult { ok: false, entries: Vec::new() }),
            },
            Err(_) => OperationResult::List(ListResult { ok: false, entries: Vec::new() }),
        },
        Operation::Load(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => {
                let rel = format!("{bucket}/{}/{}", req.dir, req.name);
                match ctx.backend.load(&rel, req.offset, req.length) {
                    Ok(data) => OperationResult::Load(LoadResult { ok: true, data }),
                    Err(_) => OperationResult::Load(LoadResult { ok: false, data: Vec::new() }),
                }
            }
            Err(_) => OperationResult::Load(LoadResult { ok: false, data: Vec::new() }),
        },
        Operation::Remove(req) => match resolve_bucket(ctx, &req.bucket_ref) {
            Ok(bucket) => {
                let rel = format!("{bucket}/{}/{}", req.dir, req.name);
                let ok = ctx.backend.remove(&rel).is_ok();
                OperationResult::Remove(RemoveResult { ok })
            }
            Err(_) => OperationResult::Remove(RemoveResult { ok: false }),
        },
        Operation::Close(req) => {
            let ok = ctx.registry.remove(&req.client_id).is_ok();
            OperationResult::Close(CloseResult { ok })
        }
    }
}
