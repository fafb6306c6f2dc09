use crate::config::Settings;
use crate::metrics;
use crate::models::Task;
use crate::notify::{NotificationEvent, Notifier};
use crate::pipeline::{GenerationPipeline, TaskProgress};
use crate::store::{StoreError, TaskStore};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything a consumer loop needs, shared across the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub pipeline: Arc<GenerationPipeline>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: Settings,
}

/// A fixed-size pool of consumer loops over the shared Task Store. Workers
/// compete through `lease`; each leased task gets exactly one terminal
/// transition and at most one notification from the worker that drove it.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(ctx: WorkerContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..ctx.settings.pool_size)
            .map(|n| {
                let ctx = ctx.clone();
                let rx = shutdown.subscribe();
                let worker_id = format!("worker-{n}");
                tokio::spawn(async move { consumer_loop(worker_id, ctx, rx).await })
            })
            .collect();
        Self { handles, shutdown }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(target = "pagecraft.worker", error = %err, "worker panicked");
            }
        }
    }
}

async fn consumer_loop(worker_id: String, ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    info!(target = "pagecraft.worker", worker = %worker_id, "worker started");
    let mut idle = ctx.settings.backoff_base;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx.store.lease(&worker_id).await {
            Ok(Some(task)) => {
                idle = ctx.settings.backoff_base;
                process(&worker_id, &ctx, task).await;
            }
            Ok(None) => {
                if sleep_or_shutdown(jittered(idle), &mut shutdown).await {
                    break;
                }
                idle = (idle * 2).min(ctx.settings.backoff_cap);
            }
            Err(err) => {
                warn!(
                    target = "pagecraft.worker",
                    worker = %worker_id,
                    error = %err,
                    "lease attempt failed"
                );
                if sleep_or_shutdown(jittered(idle), &mut shutdown).await {
                    break;
                }
                idle = (idle * 2).min(ctx.settings.backoff_cap);
            }
        }
    }
    info!(target = "pagecraft.worker", worker = %worker_id, "worker stopped");
}

/// Sleeps for `duration`, returning true if shutdown was signalled meanwhile.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_ok() && *shutdown.borrow(),
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    base.mul_f64(factor)
}

async fn process(worker_id: &str, ctx: &WorkerContext, task: Task) {
    info!(
        target = "pagecraft.worker",
        worker = %worker_id,
        task_id = %task.id,
        attempt = task.attempts,
        "task leased"
    );
    // A task re-leased past its attempt budget settles as failed instead of
    // running again; the error notification still goes out.
    if task.attempts > ctx.settings.max_attempts {
        settle_failure(worker_id, ctx, &task, "max retries exceeded").await;
        return;
    }
    // The run must not outlive its lease, or a reclaiming worker could race
    // this one to the terminal transition.
    let outcome = tokio::time::timeout(ctx.settings.lease_timeout, ctx.pipeline.run(&task)).await;

    match outcome {
        Ok(Ok(result)) => {
            let details_id = result.product_details_id;
            let persisted = TaskProgress::Persisted;
            if let Err(err) = ctx
                .store
                .set_progress(task.id, persisted.percent(), persisted.message())
                .await
            {
                warn!(
                    target = "pagecraft.worker",
                    task_id = %task.id,
                    error = %err,
                    "final progress write failed"
                );
            }
            match ctx.store.complete(task.id, result).await {
                Ok(()) => {
                    metrics::inc_tasks("completed");
                    ctx.notifier
                        .publish(&NotificationEvent::success(
                            task.id,
                            &task.payload.user_id,
                            task.payload.user_session.as_deref(),
                            details_id,
                        ))
                        .await;
                }
                Err(StoreError::TerminalState(_)) => {
                    // A reclaimed run already settled this task; its worker
                    // also owns the notification.
                    warn!(
                        target = "pagecraft.worker",
                        worker = %worker_id,
                        task_id = %task.id,
                        "task already terminal, dropping completion"
                    );
                }
                Err(err) => {
                    error!(
                        target = "pagecraft.worker",
                        worker = %worker_id,
                        task_id = %task.id,
                        error = %err,
                        "failed to persist completion"
                    );
                }
            }
        }
        Ok(Err(pipeline_err)) => {
            let detail = pipeline_err.to_string();
            settle_failure(worker_id, ctx, &task, &detail).await;
        }
        Err(_) => {
            let detail = format!(
                "generation timed out after {:?}",
                ctx.settings.lease_timeout
            );
            settle_failure(worker_id, ctx, &task, &detail).await;
        }
    }
}

async fn settle_failure(worker_id: &str, ctx: &WorkerContext, task: &Task, detail: &str) {
    match ctx.store.fail(task.id, detail).await {
        Ok(()) => {
            metrics::inc_tasks("failed");
            warn!(
                target = "pagecraft.worker",
                worker = %worker_id,
                task_id = %task.id,
                error = detail,
                "task failed"
            );
            ctx.notifier
                .publish(&NotificationEvent::error(
                    task.id,
                    &task.payload.user_id,
                    task.payload.user_session.as_deref(),
                    detail,
                ))
                .await;
        }
        Err(StoreError::TerminalState(_)) => {
            warn!(
                target = "pagecraft.worker",
                worker = %worker_id,
                task_id = %task.id,
                "task already terminal, dropping failure"
            );
        }
        Err(err) => {
            error!(
                target = "pagecraft.worker",
                worker = %worker_id,
                task_id = %task.id,
                error = %err,
                "failed to persist failure"
            );
        }
    }
}
