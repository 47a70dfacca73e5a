//! Worker runtime: polling consumers over the two queues.
//!
//! Spawns `folder_concurrency` consumers on the `folders` queue and
//! `image_concurrency` consumers on the `images` queue, plus the recovery
//! supervisor loop. Each consumer claims one job at a time; a claimed job
//! heartbeats on an interval so the supervisor can tell live work from
//! stalled work.
//!
//! Shutdown is cooperative: on cancellation the consumers stop claiming and
//! in-flight jobs finish (or are declared stalled by the next supervisor
//! pass if the process dies first).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::AppContext;
use crate::error::Error;
use crate::folder_worker::run_folder_job;
use crate::image_worker::{run_image_batch, run_single_image};
use crate::models::{JobPayload, FOLDER_QUEUE, IMAGE_QUEUE};
use crate::queue::Job;
use crate::recovery;

const IDLE_POLL: Duration = Duration::from_millis(500);
const ERROR_POLL: Duration = Duration::from_secs(2);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);

/// Runs the full worker runtime until `shutdown` fires.
pub async fn run(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    // Surfacing missed work first means a restarted process picks up where
    // the dead one stopped before accepting anything new.
    if let Err(e) = recovery::run_sweep(&ctx).await {
        warn!(error = %e, "startup recovery sweep failed");
    }

    let mut tasks = JoinSet::new();

    for slot in 0..ctx.config.workers.folder_concurrency {
        tasks.spawn(consume(
            ctx.clone(),
            FOLDER_QUEUE,
            slot,
            shutdown.clone(),
        ));
    }
    for slot in 0..ctx.config.workers.image_concurrency {
        tasks.spawn(consume(ctx.clone(), IMAGE_QUEUE, slot, shutdown.clone()));
    }
    tasks.spawn(recovery::run_loop(ctx.clone(), shutdown.clone()));

    info!(
        folder_consumers = ctx.config.workers.folder_concurrency,
        image_consumers = ctx.config.workers.image_concurrency,
        "workers started"
    );

    while tasks.join_next().await.is_some() {}
    info!("workers stopped");
}

async fn consume(
    ctx: Arc<AppContext>,
    queue_name: &'static str,
    slot: usize,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let claimed = ctx.queue.dequeue(queue_name).await;
        match claimed {
            Ok(Some(job)) => handle_job(&ctx, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Err(e) => {
                warn!(queue = queue_name, slot, error = %e, "dequeue failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(ERROR_POLL) => {}
                }
            }
        }
    }
}

async fn handle_job(ctx: &Arc<AppContext>, job: Job) {
    let heartbeat = spawn_heartbeat(ctx.clone(), job.job_id.clone());

    let result = dispatch(ctx, &job).await;

    heartbeat.abort();

    match result {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(&job.job_id).await {
                warn!(job_id = %job.job_id, error = %e, "could not mark job completed");
            }
        }
        Err(e) => {
            error!(job_id = %job.job_id, attempt = job.attempts, error = %e, "job failed");
            if let Err(mark) = ctx.queue.fail(&job.job_id, &e.to_string()).await {
                warn!(job_id = %job.job_id, error = %mark, "could not record job failure");
            }
        }
    }
}

async fn dispatch(ctx: &Arc<AppContext>, job: &Job) -> Result<(), Error> {
    match &job.payload {
        JobPayload::Folder {
            folder_id,
            credential,
        } => run_folder_job(ctx, *folder_id, credential.as_deref()).await,
        JobPayload::Image {
            image_id,
            credential,
        } => run_single_image(ctx, *image_id, credential.as_deref()).await,
        JobPayload::ImageBatch {
            image_ids,
            credential,
            ..
        } => {
            let outcome = run_image_batch(ctx, image_ids, credential.as_deref()).await?;
            info!(
                job_id = %job.job_id,
                processed = outcome.processed,
                failed = outcome.failed,
                "batch finished"
            );
            Ok(())
        }
    }
}

fn spawn_heartbeat(ctx: Arc<AppContext>, job_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_EVERY).await;
            if let Err(e) = ctx.queue.heartbeat(&job_id).await {
                warn!(job_id = %job_id, error = %e, "heartbeat failed");
            }
        }
    })
}
