//! Subscribes once to the command subject, fans that single subscription
//! out to N worker tasks pulling from one shared bounded channel, and
//! carries a cooperative shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Message, Subscription};
use crate::runtime::Runtime;
use crate::worker::{self, WorkerContext};
use crate::{Error, Result};

/// Soft deadline WPL waits for in-flight workers to drain past `dying`
/// before giving up on a clean join.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A `Subscription` handle onto a channel shared by every worker. Each
/// `next` call locks the receiver only long enough to pull the next
/// message, so workers take turns dequeuing but process concurrently.
struct SharedQueue {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

#[async_trait]
impl Subscription for SharedQueue {
    async fn next(&mut self, deadline: Duration) -> Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        // Workers share one underlying bus subscription; tearing it down
        // happens once, in the pump task, not per worker.
        Ok(())
    }
}

pub struct Pool {
    dying: CancellationToken,
    workers: JoinSet<()>,
    pump: tokio::task::JoinHandle<()>,
    shared_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    runtime: Runtime,
}

impl Pool {
    /// Queue-subscribe once to the command subject, forward it into a
    /// shared channel of depth `workers.queue_depth`, and spawn
    /// `N = workers.count` worker tasks pulling from that channel.
    pub async fn start(runtime: Runtime) -> Result<Self> {
        let dying = CancellationToken::new();

        let sub = runtime
            .bus
            .queue_subscribe(crate::config::COMMAND_SUBJECT, crate::config::WORKER_QUEUE_GROUP)
            .await?;
        let (tx, rx) = mpsc::channel(runtime.config.workers.queue_depth);
        let shared_rx = Arc::new(Mutex::new(rx));
        let pump = tokio::spawn(pump_loop(sub, tx, dying.clone()));

        let mut workers = JoinSet::new();
        for i in 0..runtime.config.workers.count {
            spawn_worker(&runtime, &dying, &mut workers, shared_rx.clone(), i);
        }

        Ok(Self { dying, workers, pump, shared_rx, runtime })
    }

    /// Run until `dying` is cancelled from outside (e.g. by a signal
    /// handler), replacing any worker that exits early, then
    /// drain with a soft deadline.
    pub async fn run_until_shutdown(mut self, dying: CancellationToken) {
        loop {
            tokio::select! {
                _ = dying.cancelled() => break,
                finished = self.workers.join_next() => {
                    match finished {
                        Some(_) if !self.dying.is_cancelled() => {
                            warn!("a worker exited early; replacing it");
                            let next = self.workers.len();
                            spawn_worker(&self.runtime, &self.dying, &mut self.workers, self.shared_rx.clone(), next);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        self.dying.cancel();
        info!("shutting down, draining workers");
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.pump).await;
    }
}

/// Forward messages from the single bus subscription into the shared
/// channel until `dying` fires or the subscription closes.
async fn pump_loop(mut sub: Box<dyn Subscription>, tx: mpsc::Sender<Message>, dying: CancellationToken) {
    loop {
        tokio::select! {
            _ = dying.cancelled() => break,
            msg = sub.next(Duration::from_secs(3600)) => {
                match msg {
                    Ok(Some(msg)) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(Error::Timeout) => continue,
                    Err(e) => {
                        warn!(error = %e, "bus subscription failed, stopping pump");
                        break;
                    }
                }
            }
        }
    }
    let _ = sub.unsubscribe().await;
}

fn spawn_worker(
    runtime: &Runtime,
    dying: &CancellationToken,
    workers: &mut JoinSet<()>,
    shared_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    index: usize,
) {
    let ctx = WorkerContext {
        bus: runtime.bus.clone(),
        registry: runtime.registry.clone(),
        backend: runtime.backend.clone(),
        job_timeout: Duration::from_secs(runtime.config.workers.job_timeout_secs),
    };
    let sub: Box<dyn Subscription> = Box::new(SharedQueue { rx: shared_rx });
    info!(worker = index, "starting worker");
    workers.spawn(worker::run(ctx, sub, dying.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::config::Config;
    use std::sync::Arc;

    #[tokio::test]
    async fn start_spawns_the_configured_worker_count() {
        let mut config = Config::default();
        config.workers.count = 3;
        let bus: Arc<dyn crate::bus::Bus> = Arc::new(MockBus::new(1_000_000));
        let runtime = Runtime::with_bus(config, bus);
        let pool = Pool::start(runtime).await.unwrap();
        assert_eq!(pool.workers.len(), 3);
        pool.dying.cancel();
    }

    #[tokio::test]
    async fn run_until_shutdown_returns_once_cancelled() {
        let mut config = Config::default();
        config.workers.count = 1;
        let bus: Arc<dyn crate::bus::Bus> = Arc::new(MockBus::new(1_000_000));
        let runtime = Runtime::with_bus(config, bus);
        let pool = Pool::start(runtime).await.unwrap();
        let dying = CancellationToken::new();
        let dying_clone = dying.clone();
        let handle = tokio::spawn(pool.run_until_shutdown(dying_clone));
        dying.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Several workers pulling from the one shared channel each get a
    /// distinct message, and every request still gets answered.
    #[tokio::test]
    async fn concurrent_requests_fan_out_across_shared_workers() {
        use crate::protocol::chunk::{chunk_limit, send_request};
        use crate::protocol::{random_token, OpKind, OpenOp, OpenResult};

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        let mut config = Config::default();
        config.workers.count = 4;
        config.repo_root = dir.path().to_path_buf();
        let bus: Arc<dyn crate::bus::Bus> = Arc::new(MockBus::new(1_000_000));
        let runtime = Runtime::with_bus(config, bus.clone());
        let pool = Pool::start(runtime).await.unwrap();

        let limit = chunk_limit(bus.max_payload());
        let mut sends = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            sends.push(tokio::spawn(async move {
                let body = bincode::serialize(&OpenOp { bucket: "alice".to_string() }).unwrap();
                let msg = crate::bus::Message::new(crate::config::COMMAND_SUBJECT)
                    .set_header(crate::protocol::HEADER_MSGID, random_token())
                    .set_header(crate::protocol::HEADER_OP, OpKind::Open.as_header_value())
                    .with_body(body);
                let reply = send_request(bus.as_ref(), msg, limit, Duration::from_secs(2))
                    .await
                    .unwrap();
                let result: OpenResult = bincode::deserialize(&reply.body).unwrap();
                assert!(result.ok);
            }));
        }
        for s in sends {
            s.await.unwrap();
        }

        pool.dying.cancel();
    }
}
