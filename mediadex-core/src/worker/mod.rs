//! The worker lifecycle framework: run-loop, heartbeat, command handling and
//! graceful shutdown. Each OS process hosts exactly one stage; stages plug in
//! through [`WorkerStage`] and never talk to the lifecycle machinery beyond
//! the context handed to them.

pub mod flight_log;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::model::{WorkerCommand, WorkerState};
use crate::repository::worker as worker_repo;
use crate::worker::flight_log::FlightLog;

/// Shared stats cell between the run-loop (writer) and the heartbeat task
/// (reader). The only mutable state the two activities share.
#[derive(Clone, Default)]
pub struct StatsCell(Arc<Mutex<Option<Value>>>);

impl StatsCell {
    pub fn set(&self, stats: Option<Value>) {
        *self.0.lock().expect("stats lock") = stats;
    }

    /// Merge a single field into the current stats object.
    pub fn set_field(&self, key: &str, value: Value) {
        let mut guard = self.0.lock().expect("stats lock");
        match guard.as_mut() {
            Some(Value::Object(map)) => {
                map.insert(key.into(), value);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(key.into(), value);
                *guard = Some(Value::Object(map));
            }
        }
    }

    pub fn get(&self) -> Option<Value> {
        self.0.lock().expect("stats lock").clone()
    }
}

pub struct WorkerContext {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub worker_id: String,
    pub hostname: String,
    pub shutdown: CancellationToken,
    pub stats: StatsCell,
}

impl WorkerContext {
    /// Cooperative cancellation predicate, polled by stages between units of
    /// work (per directory, per frame, per scene).
    pub fn should_stop(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn lease_ttl_secs(&self) -> i64 {
        self.config.lease_ttl_secs()
    }
}

#[async_trait]
pub trait WorkerStage: Send {
    fn role(&self) -> &'static str;

    /// One-time setup before the run-loop, e.g. a `--repair` pass.
    async fn before_loop(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }

    /// Claim and process at most one asset. Returns whether anything was
    /// claimed; `false` puts the worker to sleep for one poll interval.
    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool>;
}

pub fn make_worker_id(role: &str, hostname: &str) -> String {
    let suffix: u32 = rand::random::<u32>() & 0x00ff_ffff;
    format!("{role}-{hostname}-{suffix:06x}")
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

async fn sleep_or_shutdown(token: &CancellationToken, duration: std::time::Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("cannot install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("interrupt received, requesting graceful shutdown");
        token.cancel();
    });
}

fn spawn_heartbeat(
    pool: PgPool,
    worker_id: String,
    stats: StatsCell,
    token: CancellationToken,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = stats.get();
                    if let Err(e) = worker_repo::heartbeat(&pool, &worker_id, snapshot.as_ref()).await {
                        warn!("heartbeat write failed: {e}");
                    }
                }
            }
        }
    })
}

/// Host a stage for the lifetime of the process. Registers the worker row,
/// verifies the schema generation, runs heartbeat + signal handling, then
/// drives the claim/process loop until shutdown (or, with `once`, until the
/// queue is drained).
pub async fn run_worker(
    pool: PgPool,
    config: Arc<Config>,
    flight: FlightLog,
    mut stage: Box<dyn WorkerStage>,
    once: bool,
    worker_name: Option<String>,
) -> Result<()> {
    db::check_schema_version(&pool).await?;

    let hostname = local_hostname();
    let worker_id =
        worker_name.unwrap_or_else(|| make_worker_id(stage.role(), &hostname));
    let shutdown = CancellationToken::new();
    let stats = StatsCell::default();

    worker_repo::register(&pool, &worker_id, &hostname, WorkerState::Idle).await?;
    info!(worker_id = %worker_id, role = stage.role(), "worker starting");

    spawn_signal_listener(shutdown.clone());
    let heartbeat = spawn_heartbeat(
        pool.clone(),
        worker_id.clone(),
        stats.clone(),
        shutdown.clone(),
        config.heartbeat_interval,
    );

    let ctx = WorkerContext {
        pool: pool.clone(),
        config: config.clone(),
        worker_id: worker_id.clone(),
        hostname,
        shutdown: shutdown.clone(),
        stats,
    };

    let run_result = run_loop(&mut stage, &ctx, &flight, once).await;

    shutdown.cancel();
    let _ = heartbeat.await;
    worker_repo::set_state(&pool, &worker_id, WorkerState::Offline).await?;
    info!(worker_id = %ctx.worker_id, "worker stopped");
    run_result
}

async fn run_loop(
    stage: &mut Box<dyn WorkerStage>,
    ctx: &WorkerContext,
    flight: &FlightLog,
    once: bool,
) -> Result<()> {
    stage.before_loop(ctx).await?;

    let mut state = WorkerState::Idle;
    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }
        match worker_repo::take_command(&ctx.pool, &ctx.worker_id).await? {
            WorkerCommand::None | WorkerCommand::Resume => {}
            WorkerCommand::Pause => {
                info!("pause requested");
                worker_repo::set_state(&ctx.pool, &ctx.worker_id, WorkerState::Paused).await?;
                state = WorkerState::Paused;
                pause_until_resumed(ctx).await?;
                if ctx.shutdown.is_cancelled() {
                    break;
                }
            }
            WorkerCommand::Shutdown => {
                info!("shutdown command received");
                ctx.shutdown.cancel();
                break;
            }
            WorkerCommand::ForensicDump => match flight.dump(&ctx.worker_id) {
                Ok(path) => info!("flight log dumped to {}", path.display()),
                Err(e) => error!("flight log dump failed: {e}"),
            },
        }

        if state != WorkerState::Processing {
            worker_repo::set_state(&ctx.pool, &ctx.worker_id, WorkerState::Processing).await?;
            state = WorkerState::Processing;
        }
        match stage.process_one(ctx).await {
            Ok(true) => continue,
            Ok(false) => {
                if state != WorkerState::Idle {
                    worker_repo::set_state(&ctx.pool, &ctx.worker_id, WorkerState::Idle).await?;
                    state = WorkerState::Idle;
                }
                if once {
                    break;
                }
                sleep_or_shutdown(&ctx.shutdown, ctx.config.poll_interval).await;
            }
            Err(e) if e.is_fatal() => {
                error!("fatal worker error: {e}");
                if let Ok(path) = flight.dump(&ctx.worker_id) {
                    error!("flight log dumped to {}", path.display());
                }
                return Err(e);
            }
            Err(e) => {
                // Attempt-level blowup outside per-asset handling: keep the
                // worker alive but preserve the surrounding context.
                error!("stage error: {e}");
                if let Ok(path) = flight.dump(&ctx.worker_id) {
                    warn!("flight log dumped to {}", path.display());
                }
                sleep_or_shutdown(&ctx.shutdown, ctx.config.poll_interval).await;
            }
        }
    }
    Ok(())
}

/// Paused workers keep heartbeating and polling for `resume` or `shutdown`;
/// claiming is suspended.
async fn pause_until_resumed(ctx: &WorkerContext) -> Result<()> {
    loop {
        if ctx.shutdown.is_cancelled() {
            return Ok(());
        }
        sleep_or_shutdown(&ctx.shutdown, ctx.config.poll_interval).await;
        match worker_repo::take_command(&ctx.pool, &ctx.worker_id).await? {
            WorkerCommand::Resume => {
                info!("resuming");
                return Ok(());
            }
            WorkerCommand::Shutdown => {
                ctx.shutdown.cancel();
                return Ok(());
            }
            _ => {}
        }
    }
}
