use serde_json::Value;
use sqlx::PgPool;

use crate::error::Result;
use crate::model::{WorkerCommand, WorkerRow, WorkerState};

pub async fn register(
    pool: &PgPool,
    worker_id: &str,
    hostname: &str,
    state: WorkerState,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO worker_status (worker_id, hostname, last_seen_at, state, command)
         VALUES ($1, $2, NOW(), $3, 'none')
         ON CONFLICT (worker_id) DO UPDATE SET
             hostname = EXCLUDED.hostname,
             last_seen_at = NOW(),
             state = EXCLUDED.state",
    )
    .bind(worker_id)
    .bind(hostname)
    .bind(state.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn heartbeat(pool: &PgPool, worker_id: &str, stats: Option<&Value>) -> Result<()> {
    sqlx::query(
        "UPDATE worker_status
         SET last_seen_at = NOW(), stats = COALESCE($2, stats)
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .bind(stats)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_state(pool: &PgPool, worker_id: &str, state: WorkerState) -> Result<()> {
    sqlx::query("UPDATE worker_status SET state = $2 WHERE worker_id = $1")
        .bind(worker_id)
        .bind(state.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Read and consume the pending command in one round-trip: anything other
/// than `none` is atomically reset so a command is obeyed exactly once.
pub async fn take_command(pool: &PgPool, worker_id: &str) -> Result<WorkerCommand> {
    let taken: Option<String> = sqlx::query_scalar(
        "UPDATE worker_status SET command = 'none'
         WHERE worker_id = $1 AND command <> 'none'
         RETURNING command",
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    Ok(match taken {
        Some(cmd) => WorkerCommand::try_from(cmd)?,
        None => WorkerCommand::None,
    })
}

pub async fn send_command(pool: &PgPool, worker_id: &str, command: WorkerCommand) -> Result<bool> {
    let updated = sqlx::query("UPDATE worker_status SET command = $2 WHERE worker_id = $1")
        .bind(worker_id)
        .bind(command.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated > 0)
}

pub async fn list(pool: &PgPool) -> Result<Vec<WorkerRow>> {
    Ok(sqlx::query_as::<_, WorkerRow>(
        "SELECT worker_id, hostname, last_seen_at, state, command, stats
         FROM worker_status ORDER BY worker_id",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn count_stale(pool: &PgPool, max_age_hours: i64) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM worker_status
         WHERE last_seen_at < NOW() - make_interval(hours => $1::int)",
    )
    .bind(max_age_hours)
    .fetch_one(pool)
    .await?)
}

pub async fn prune_stale(pool: &PgPool, max_age_hours: i64) -> Result<u64> {
    Ok(sqlx::query(
        "DELETE FROM worker_status
         WHERE last_seen_at < NOW() - make_interval(hours => $1::int)",
    )
    .bind(max_age_hours)
    .execute(pool)
    .await?
    .rows_affected())
}

/// Heartbeat-stats hint used by temp GC: is any live worker on this host in
/// the middle of a transcode?
pub async fn has_active_local_transcode(pool: &PgPool, hostname: &str) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM worker_status
         WHERE hostname = $1
           AND state <> 'offline'
           AND last_seen_at >= NOW() - INTERVAL '120 seconds'
           AND stats IS NOT NULL
           AND stats->>'current_stage' = 'transcode'",
    )
    .bind(hostname)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}
