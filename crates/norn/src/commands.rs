//! Administrative subcommands: everything that only reads or edits task
//! rows, as opposed to `monitor` and `worker` which run the scheduler.

use std::io::Write;

use anyhow::{bail, Context};
use chrono::Utc;
use norn_scheduler::{NewTask, Store, Task, TaskRegistry};

#[allow(clippy::too_many_arguments)]
pub fn register(
    out: &mut dyn Write,
    store: &Store,
    registry: &TaskRegistry,
    environment: &str,
    function: &str,
    interval_secs: u64,
    name: Option<String>,
    disabled: bool,
) -> anyhow::Result<Task> {
    let registered = registry
        .resolve(function)
        .with_context(|| format!("`{function}` is not registered (see `norn functions`)"))?;
    if interval_secs == 0 {
        bail!("--interval-secs must be at least 1");
    }
    let interval = i64::try_from(interval_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("--interval-secs {interval_secs} is too large"))?;

    let new = NewTask::new(
        name.unwrap_or_else(|| registered.name.clone()),
        function,
        interval,
        environment,
    )
    .disabled(disabled);
    let task = store.create_task(&new)?;
    writeln!(out, "registered task {} ({}) every {}", task.id, task.name, format_interval(task.interval))?;
    Ok(task)
}

pub fn list(out: &mut dyn Write, store: &Store, environment: &str, json: bool) -> anyhow::Result<()> {
    let tasks = store.list_tasks(environment)?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&tasks)?)?;
        return Ok(());
    }
    if tasks.is_empty() {
        writeln!(out, "no tasks in environment `{environment}`")?;
        return Ok(());
    }
    writeln!(out, "{:>4}  {:<24} {:<32} {:>8}  {:<14} NEXT", "ID", "NAME", "FUNCTION", "EVERY", "STATE")?;
    for task in &tasks {
        let next = task
            .next_execution_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{:>4}  {:<24} {:<32} {:>8}  {:<14} {}",
            task.id,
            task.name,
            task.function,
            format_interval(task.interval),
            state_label(task),
            next
        )?;
    }
    Ok(())
}

pub fn set_disabled(
    out: &mut dyn Write,
    store: &Store,
    environment: &str,
    task_id: i64,
    disabled: bool,
) -> anyhow::Result<()> {
    let task = store.get_task_in_env(task_id, environment)?;
    store.set_disabled(task.id, disabled)?;
    let verb = if disabled { "disabled" } else { "enabled" };
    writeln!(out, "{verb} task {} ({})", task.id, task.name)?;
    Ok(())
}

/// Ask the owning worker to release the lease. The monitor starts a fresh
/// worker for the task once the old one has exited.
pub fn stop(out: &mut dyn Write, store: &Store, environment: &str, task_id: i64) -> anyhow::Result<()> {
    let task = store.get_task_in_env(task_id, environment)?;
    store.request_shutdown(task.id, Utc::now())?;
    match task.pid {
        Some(pid) => writeln!(out, "shutdown requested for task {} (worker pid {pid})", task.id)?,
        None => writeln!(out, "shutdown requested for task {} (no worker running)", task.id)?,
    }
    Ok(())
}

pub fn logs(
    out: &mut dyn Write,
    store: &Store,
    environment: &str,
    task_id: i64,
    json: bool,
) -> anyhow::Result<()> {
    let task = store.get_task_in_env(task_id, environment)?;
    let logs = store.logs_for_task(task.id)?;

    if json {
        let mut entries = Vec::with_capacity(logs.len());
        for log in &logs {
            let lines: Vec<String> = store.log_items(log.id)?.into_iter().map(|i| i.data).collect();
            entries.push(serde_json::json!({ "log": log, "lines": lines }));
        }
        writeln!(out, "{}", serde_json::to_string_pretty(&entries)?)?;
        return Ok(());
    }

    if logs.is_empty() {
        writeln!(out, "no logs for task {} ({})", task.id, task.name)?;
        return Ok(());
    }
    for log in &logs {
        writeln!(out, "--- {} run {}", log.execution_time.to_rfc3339(), log.run_id)?;
        for item in store.log_items(log.id)? {
            writeln!(out, "{}", item.data)?;
        }
    }
    Ok(())
}

pub fn functions(out: &mut dyn Write, registry: &TaskRegistry) -> anyhow::Result<()> {
    for task in registry.list() {
        let mode = if task.transactional { "" } else { " [no transaction]" };
        if task.description.is_empty() {
            writeln!(out, "{}{mode}", task.key)?;
        } else {
            writeln!(out, "{}{mode} - {}", task.key, task.description)?;
        }
    }
    Ok(())
}

fn state_label(task: &Task) -> String {
    match (task.disabled, task.pid, task.shutdown_command) {
        (_, Some(_), Some(_)) => "stopping".to_string(),
        (_, Some(pid), None) => format!("running:{pid}"),
        (true, None, _) => "disabled".to_string(),
        (false, None, _) => "waiting".to_string(),
    }
}

/// "90s" -> "1m30s", "86400s" -> "1d"
fn format_interval(interval: chrono::Duration) -> String {
    let ms = interval.num_milliseconds();
    if ms % 1_000 != 0 {
        return format!("{ms}ms");
    }
    let mut secs = ms / 1_000;
    let mut parts = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size {
            parts.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    if secs > 0 || parts.is_empty() {
        parts.push_str(&format!("{secs}s"));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::builtin_registry;

    fn output(f: impl FnOnce(&mut Vec<u8>)) -> String {
        let mut out = Vec::new();
        f(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn interval_formatting() {
        assert_eq!(format_interval(chrono::Duration::seconds(90)), "1m30s");
        assert_eq!(format_interval(chrono::Duration::days(1)), "1d");
        assert_eq!(format_interval(chrono::Duration::seconds(3_605)), "1h5s");
        assert_eq!(format_interval(chrono::Duration::milliseconds(250)), "250ms");
    }

    #[test]
    fn register_requires_known_function_and_positive_interval() {
        let store = Store::open_in_memory().unwrap();
        let registry = builtin_registry();
        let mut sink = std::io::sink();

        let err = register(&mut sink, &store, &registry, "default", "nope.x", 60, None, false)
            .unwrap_err();
        assert!(err.to_string().contains("not registered"));
        assert!(register(&mut sink, &store, &registry, "default", "norn.echo", 0, None, false).is_err());
        let err = register(&mut sink, &store, &registry, "default", "norn.echo", u64::MAX / 2, None, false)
            .unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        let err = register(&mut sink, &store, &registry, "default", "norn.echo", 9_300_000_000_000_000, None, false)
            .unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        // In range for a duration, but not in microseconds.
        assert!(register(&mut sink, &store, &registry, "default", "norn.echo", 9_300_000_000_000, None, false).is_err());
        assert!(store.list_tasks("default").unwrap().is_empty());

        let task = register(&mut sink, &store, &registry, "default", "norn.echo", 60, None, true)
            .unwrap();
        assert_eq!(task.name, "Echo");
        assert!(task.disabled);
        assert_eq!(task.interval, chrono::Duration::minutes(1));
    }

    #[test]
    fn admin_commands_are_scoped_to_environment() {
        let store = Store::open_in_memory().unwrap();
        let registry = builtin_registry();
        let task = register(
            &mut std::io::sink(),
            &store,
            &registry,
            "staging",
            "norn.echo",
            60,
            Some("heartbeat".into()),
            false,
        )
        .unwrap();

        assert!(set_disabled(&mut std::io::sink(), &store, "default", task.id, true).is_err());
        assert!(stop(&mut std::io::sink(), &store, "default", task.id).is_err());

        let text = output(|out| set_disabled(out, &store, "staging", task.id, true).unwrap());
        assert_eq!(text, format!("disabled task {} (heartbeat)\n", task.id));
        assert!(store.get_task(task.id).unwrap().disabled);

        let listing = output(|out| list(out, &store, "staging", false).unwrap());
        assert!(listing.contains("heartbeat"));
        assert!(listing.contains("disabled"));
        let empty = output(|out| list(out, &store, "default", false).unwrap());
        assert_eq!(empty, "no tasks in environment `default`\n");
    }

    #[test]
    fn stop_sets_shutdown_command() {
        let store = Store::open_in_memory().unwrap();
        let registry = builtin_registry();
        let task = register(&mut std::io::sink(), &store, &registry, "default", "norn.echo", 60, None, false)
            .unwrap();

        let text = output(|out| stop(out, &store, "default", task.id).unwrap());
        assert!(text.contains("no worker running"));
        assert!(store.get_task(task.id).unwrap().shutdown_command.is_some());
    }

    #[test]
    fn json_listing_uses_millisecond_interval() {
        let store = Store::open_in_memory().unwrap();
        let registry = builtin_registry();
        register(&mut std::io::sink(), &store, &registry, "default", "norn.echo", 2, None, false)
            .unwrap();

        let text = output(|out| list(out, &store, "default", true).unwrap());
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["function"], "norn.echo");
        assert_eq!(parsed[0]["interval_ms"], 2_000);
        assert_eq!(parsed[0]["environment"], "default");
    }

    #[test]
    fn functions_lists_builtins() {
        let text = output(|out| functions(out, &builtin_registry()).unwrap());
        assert_eq!(
            text,
            "norn.echo - Print a liveness line\nnorn.vacuum [no transaction] - Compact the database file\n"
        );
    }
}
