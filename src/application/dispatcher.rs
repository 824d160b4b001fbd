//! Job consumption loop and status state machine.
//!
//! Each dispatcher instance pulls one envelope at a time, records
//! `processing` before any work, routes by the closed job-kind set, and
//! writes exactly one terminal status. A failing job (error, timeout, even
//! a panic) never takes the loop down with it: the job runs in its own task
//! and the loop continues at the next dequeue.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    application::render::RenderService,
    domain::job::{JobEnvelope, JobRequest},
    infra::{
        queue::{JobQueue, QueueItem},
        status::StatusStore,
    },
};

const TARGET: &str = "application::dispatcher";

/// Pause after a queue transport error so a dead broker cannot hot-loop us.
const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    status: Arc<dyn StatusStore>,
    renderer: Arc<RenderService>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        status: Arc<dyn StatusStore>,
        renderer: Arc<RenderService>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            status,
            renderer,
            poll_interval,
            shutdown,
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(self, worker: usize) {
        info!(target = TARGET, worker, "dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = self.queue.dequeue(self.poll_interval) => match polled {
                    Ok(Some(item)) => self.handle_item(worker, item).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target = TARGET,
                            worker,
                            error = %err,
                            "queue dequeue failed; backing off"
                        );
                        tokio::time::sleep(TRANSPORT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        info!(target = TARGET, worker, "dispatcher stopped");
    }

    async fn handle_item(&self, worker: usize, item: QueueItem) {
        let envelope: JobEnvelope = match serde_json::from_str(&item.raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // No usable job id, so there is no status record to fail.
                error!(
                    target = TARGET,
                    worker,
                    error = %err,
                    "dropping malformed queue item"
                );
                return;
            }
        };

        let job_id = envelope.id.clone();
        let kind = envelope.kind.clone();

        if let Err(err) = self.status.mark_processing(&job_id, &kind).await {
            // Without a processing record the outcome could not be observed
            // either; abandon this item rather than work invisibly.
            error!(
                target = TARGET,
                worker,
                job_id,
                error = %err,
                "failed to record processing status; abandoning job"
            );
            return;
        }

        // The job gets its own task so a panic is caught at the join
        // boundary instead of unwinding the loop.
        let renderer = Arc::clone(&self.renderer);
        let outcome = match tokio::spawn(run_job(renderer, envelope)).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(format!("job task aborted: {join_err}")),
        };

        let recorded = match &outcome {
            Ok(result) => self.status.complete(&job_id, result).await,
            Err(message) => self.status.fail(&job_id, message).await,
        };
        if let Err(err) = recorded {
            error!(
                target = TARGET,
                worker,
                job_id,
                error = %err,
                "failed to record terminal status"
            );
            return;
        }

        match outcome {
            Ok(_) => info!(target = TARGET, worker, job_id, kind, "job completed"),
            Err(message) => {
                warn!(target = TARGET, worker, job_id, kind, error = %message, "job failed")
            }
        }
    }
}

async fn run_job(
    renderer: Arc<RenderService>,
    envelope: JobEnvelope,
) -> Result<serde_json::Value, String> {
    match JobRequest::from_envelope(&envelope) {
        Ok(JobRequest::Render(payload)) => {
            match renderer.execute(&envelope.id, &payload).await {
                Ok(result) => serde_json::to_value(&result)
                    .map_err(|err| format!("failed to serialize render result: {err}")),
                Err(err) => Err(err.to_string()),
            }
        }
        Err(err) => Err(err.to_string()),
    }
}

/// Spawn `count` dispatcher instances sharing the same injected handles.
///
/// Each instance gets a child of `shutdown`, so cancelling the parent stops
/// the whole pool; the returned set joins them for a clean drain.
pub fn spawn_dispatchers(
    count: u32,
    queue: Arc<dyn JobQueue>,
    status: Arc<dyn StatusStore>,
    renderer: Arc<RenderService>,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> JoinSet<()> {
    let mut pool = JoinSet::new();
    for worker in 0..count {
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&status),
            Arc::clone(&renderer),
            poll_interval,
            shutdown.child_token(),
        );
        pool.spawn(dispatcher.run(worker as usize));
    }
    pool
}
