//! Task functions shipped with the `norn` binary.

use std::io::Write;

use chrono::Utc;
use norn_scheduler::{RegisteredTask, TaskContext, TaskRegistry};

pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_task(
            RegisteredTask::new("norn.echo", echo).described("Print a liveness line"),
        )
        .register_task(
            RegisteredTask::new("norn.vacuum", vacuum)
                .described("Compact the database file")
                // SQLite refuses VACUUM inside a transaction.
                .transactional(false),
        );
    registry
}

fn echo(ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
    writeln!(
        ctx,
        "norn alive: task {} pid {} at {}",
        ctx.task_id(),
        std::process::id(),
        Utc::now().to_rfc3339()
    )?;
    ctx.heartbeat()?;
    Ok(())
}

fn vacuum(ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
    let before = page_count(ctx)?;
    ctx.heartbeat()?;
    ctx.db().execute_batch("VACUUM")?;
    let after = page_count(ctx)?;

    let (logs, items): (i64, i64) = ctx.db().query_row(
        "SELECT (SELECT COUNT(*) FROM logs), (SELECT COUNT(*) FROM log_items)",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    writeln!(ctx, "vacuum: {before} -> {after} pages")?;
    writeln!(ctx, "retained: {logs} logs, {items} log lines")?;
    Ok(())
}

fn page_count(ctx: &TaskContext<'_>) -> rusqlite::Result<i64> {
    ctx.db().query_row("PRAGMA page_count", [], |row| row.get(0))
}
