// End-to-end worker runs against a real store, driven by a virtual clock.
// Every sleep advances the clock instead of blocking, so a run that would
// take minutes finishes immediately.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use norn_core::config::{KEEP_LOGS, SHUTDOWN_EXIT_CODE};
use norn_scheduler::{
    run_once, Clock, Logger, ManualClock, NewTask, SchedulerError, Store, Task, TaskRegistry, Worker,
    WorkerExit, WorkerSettings,
};
use uuid::Uuid;

fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2001, 1, 1, 1, 2, 3).unwrap()
}

fn log_lines(store: &Store, task: &Task) -> Vec<Vec<String>> {
    store
        .logs_for_task(task.id)
        .unwrap()
        .iter()
        .map(|log| {
            store
                .log_items(log.id)
                .unwrap()
                .into_iter()
                .map(|item| item.data)
                .collect()
        })
        .collect()
}

fn run_worker(
    store: &Store,
    registry: TaskRegistry,
    clock: &Arc<ManualClock>,
    settings: WorkerSettings,
    task: Task,
) -> WorkerExit {
    let mut worker = Worker::new(store, Arc::new(registry), clock.clone(), settings, task)
        .with_mirror(Box::new(std::io::sink()));
    worker.run().unwrap()
}

#[test]
fn keeps_only_the_newest_logs_of_its_own_task() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));

    let unrelated = store
        .create_task(
            &NewTask::new("unrelated", "unrelated", chrono::Duration::milliseconds(1), "default")
                .disabled(true),
        )
        .unwrap();
    for _ in 0..10 {
        Logger::open(&store, &unrelated, 100, clock.now())
            .unwrap()
            .close()
            .unwrap();
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    let seen = Arc::clone(&counter);
    registry.register("tests.basic", move |ctx| {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        writeln!(ctx, "should show up in log {n}")?;
        ctx.heartbeat()?;
        if n + 1 > KEEP_LOGS + 2 {
            return Err(SchedulerError::shutting_down("done counting").into());
        }
        Ok(())
    });

    let task = store
        .create_task(&NewTask::new(
            "basic",
            "tests.basic",
            chrono::Duration::milliseconds(1),
            "default",
        ))
        .unwrap();

    let exit = run_worker(&store, registry, &clock, WorkerSettings::default(), task.clone());
    assert_eq!(
        exit,
        WorkerExit::Shutdown {
            reason: "done counting".into()
        }
    );
    assert_eq!(exit.code(), SHUTDOWN_EXIT_CODE);

    let runs = counter.load(Ordering::SeqCst);
    assert_eq!(runs, KEEP_LOGS + 3);

    let logs = log_lines(&store, &task);
    assert_eq!(logs.len(), KEEP_LOGS);
    for (offset, lines) in logs.iter().enumerate() {
        let n = runs - KEEP_LOGS + offset;
        assert_eq!(lines, &vec![format!("should show up in log {n}")]);
    }

    assert_eq!(store.logs_for_task(unrelated.id).unwrap().len(), 10);
}

#[test]
fn crash_is_logged_after_preceding_output() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let mut registry = TaskRegistry::new();
    registry.register("tests.crash", |ctx| {
        ctx.heartbeat()?;
        writeln!(ctx, "should show up in log")?;
        Err(anyhow::anyhow!("disk full").context("exception"))
    });
    let task = store
        .create_task(&NewTask::new(
            "crash",
            "tests.crash",
            chrono::Duration::milliseconds(1),
            "default",
        ))
        .unwrap();

    let exit = run_worker(&store, registry, &clock, WorkerSettings::default(), task.clone());
    assert_eq!(
        exit,
        WorkerExit::Crashed {
            message: "exception".into()
        }
    );
    assert_eq!(exit.code(), SHUTDOWN_EXIT_CODE);

    let logs = log_lines(&store, &task);
    assert_eq!(logs.len(), 1);
    assert_eq!(
        logs[0][..3],
        ["should show up in log", "ERROR exception", "    caused by: disk full"]
    );
    // Whatever follows (a backtrace when enabled) belongs to the failure.
    assert!(logs[0][3..].iter().all(|line| line.starts_with("    ")));
}

#[test]
fn panic_is_logged_with_location_and_trace() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let mut registry = TaskRegistry::new();
    registry.register("tests.panic", |ctx| {
        writeln!(ctx, "should show up in log")?;
        panic!("disk on fire")
    });
    let task = store
        .create_task(&NewTask::new(
            "panic",
            "tests.panic",
            chrono::Duration::milliseconds(1),
            "default",
        ))
        .unwrap();

    let exit = run_worker(&store, registry, &clock, WorkerSettings::default(), task.clone());
    let WorkerExit::Crashed { message } = &exit else {
        panic!("expected a crash, got {exit:?}");
    };
    assert_eq!(message, "task panicked: disk on fire");

    let logs = log_lines(&store, &task);
    let lines = &logs[0];
    assert_eq!(lines[0], "should show up in log");
    assert_eq!(lines[1], "ERROR task panicked: disk on fire");
    assert!(lines[2].starts_with("    at ") && lines[2].contains("worker_scenarios.rs"));
    assert_eq!(lines[3], "    backtrace:");
    assert!(lines.len() > 4);
}

#[test]
fn expired_shutdown_and_distant_run_exits_without_executing() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    let seen = Arc::clone(&calls);
    registry.register("tests.never", move |_ctx| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let task = store
        .create_task(
            &NewTask::new("never", "tests.never", chrono::Duration::minutes(5), "default")
                .starting_at(start_time() + chrono::Duration::seconds(40)),
        )
        .unwrap();
    // A predecessor was asked to stop long ago and never let go.
    store.save_lease(task.id, 1, Uuid::new_v4()).unwrap();
    store
        .request_shutdown(task.id, start_time() - chrono::Duration::minutes(1))
        .unwrap();

    let settings = WorkerSettings {
        max_idle_sleep: Some(Duration::from_secs(30)),
        ..WorkerSettings::default()
    };
    let mut worker = Worker::new(&store, Arc::new(registry), clock.clone(), settings, task)
        .with_mirror(Box::new(std::io::sink()));
    let exit = worker.run().unwrap();

    assert_eq!(exit, WorkerExit::Idle);
    assert_eq!(exit.code(), SHUTDOWN_EXIT_CODE);
    assert_eq!(worker.executions(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // No waiting happened: the stale command had already expired.
    assert_eq!(clock.now(), start_time());

    let row = store.get_task(worker.task().id).unwrap();
    assert!(row.pid.is_none());
    assert!(row.shutdown_command.is_none());
    assert!(store.logs_for_task(row.id).unwrap().is_empty());
}

#[test]
fn without_idle_limit_worker_sleeps_until_due() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let mut registry = TaskRegistry::new();
    registry.register("tests.once", |_ctx| {
        Err(SchedulerError::shutting_down("ran once").into())
    });
    let due = start_time() + chrono::Duration::seconds(40);
    let task = store
        .create_task(
            &NewTask::new("once", "tests.once", chrono::Duration::minutes(5), "default")
                .starting_at(due),
        )
        .unwrap();

    let exit = run_worker(&store, registry, &clock, WorkerSettings::default(), task);
    assert_eq!(
        exit,
        WorkerExit::Shutdown {
            reason: "ran once".into()
        }
    );
    assert_eq!(clock.now(), due);
}

#[test]
fn unknown_function_ends_worker_with_shutdown() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let task = store
        .create_task(&NewTask::new(
            "missing",
            "does_not_exist.function",
            chrono::Duration::seconds(1),
            "default",
        ))
        .unwrap();

    let exit = run_worker(&store, TaskRegistry::new(), &clock, WorkerSettings::default(), task.clone());
    assert_eq!(
        exit,
        WorkerExit::Shutdown {
            reason: "Failed to execute function".into()
        }
    );
    assert_eq!(clock.now(), start_time() + chrono::Duration::seconds(1));
    assert_eq!(log_lines(&store, &task), vec![Vec::<String>::new()]);
}

#[test]
fn heartbeat_within_a_second_neither_checks_nor_writes() {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let task = store
        .create_task(&NewTask::new(
            "hb",
            "tests.hb",
            chrono::Duration::seconds(1),
            "default",
        ))
        .unwrap();
    let mut handle = norn_scheduler::TaskHandle::new(
        &store,
        Arc::new(TaskRegistry::new()),
        clock.clone(),
        Default::default(),
        task,
    );
    handle.start().unwrap();
    handle.heartbeat().unwrap();

    // Steal the lease and plant a sentinel: a check would fail, a write
    // would overwrite the sentinel.
    let side = store.open_side_connection().unwrap();
    side.execute(
        "UPDATE tasks SET pid = ?1, last_checked = 'sentinel' WHERE id = ?2",
        rusqlite::params![handle.pid() + 1, handle.task().id],
    )
    .unwrap();

    clock.advance(chrono::Duration::milliseconds(999));
    handle.heartbeat().unwrap();
    let stored: String = side
        .query_row(
            "SELECT last_checked FROM tasks WHERE id = ?1",
            [handle.task().id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, "sentinel");
}

#[test]
fn transactional_failure_rolls_back_but_keeps_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_path(dir.path().join("norn.db"))
        .unwrap()
        .with_wrapped_executions(true);
    assert!(store.wraps_executions());
    store
        .connection()
        .execute_batch("CREATE TABLE scratch (v TEXT NOT NULL)")
        .unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));

    let mut registry = TaskRegistry::new();
    registry
        .register("tests.atomic", |ctx| {
            writeln!(ctx, "before write")?;
            ctx.db().execute("INSERT INTO scratch (v) VALUES ('atomic')", [])?;
            anyhow::bail!("rollback me")
        })
        .register_non_transactional("tests.loose", |ctx| {
            writeln!(ctx, "before write")?;
            ctx.db().execute("INSERT INTO scratch (v) VALUES ('loose')", [])?;
            anyhow::bail!("keep me")
        })
        .register("tests.commit", |ctx| {
            ctx.db().execute("INSERT INTO scratch (v) VALUES ('commit')", [])?;
            Ok(())
        });
    let registry = Arc::new(registry);

    let mut outcomes = Vec::new();
    for function in ["tests.atomic", "tests.loose", "tests.commit"] {
        let run = run_once(
            &store,
            Arc::clone(&registry),
            clock.clone(),
            "default",
            KEEP_LOGS,
            function,
            &mut std::io::sink(),
        )
        .unwrap();
        outcomes.push((run.error, log_lines(&store, &run.task)));
    }

    assert_eq!(outcomes[0].0.as_deref(), Some("rollback me"));
    assert_eq!(outcomes[0].1.len(), 1);
    assert_eq!(outcomes[0].1[0][..2], ["before write", "ERROR rollback me"]);
    assert_eq!(outcomes[1].0.as_deref(), Some("keep me"));
    assert_eq!(outcomes[2].0, None);

    let mut stmt = store
        .connection()
        .prepare("SELECT v FROM scratch ORDER BY v")
        .unwrap();
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows, vec!["commit", "loose"]);
}

#[test]
fn output_after_a_wrapped_write_survives_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_path(dir.path().join("norn.db"))
        .unwrap()
        .with_wrapped_executions(true);
    store
        .connection()
        .execute_batch("CREATE TABLE scratch (v TEXT NOT NULL)")
        .unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));

    let mut registry = TaskRegistry::new();
    registry.register("tests.write_then_stop", |ctx| {
        ctx.db().execute("INSERT INTO scratch (v) VALUES ('pending')", [])?;
        writeln!(ctx, "wrote a row")?;
        Err(SchedulerError::shutting_down("stop after write").into())
    });
    let task = store
        .create_task(&NewTask::new(
            "write then stop",
            "tests.write_then_stop",
            chrono::Duration::milliseconds(1),
            "default",
        ))
        .unwrap();

    let started = std::time::Instant::now();
    let exit = run_worker(&store, registry, &clock, WorkerSettings::default(), task.clone());
    assert_eq!(
        exit,
        WorkerExit::Shutdown {
            reason: "stop after write".into()
        }
    );
    // Nothing waited on the busy timeout.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(log_lines(&store, &task), vec![vec!["wrote a row"]]);

    let rows: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 0);
}
