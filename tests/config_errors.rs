// tests/config_errors.rs

use std::io::Write;

use jobflow::config::{Catalog, LockBackend, load_and_validate, parse_and_validate, parse_raw};
use jobflow::errors::JobflowError;
use jobflow::task::model::TaskKind;
use jobflow::types::{Target, TaskId};
use jobflow_test_utils::builders::Harness;
use jobflow_test_utils::{init_tracing, with_timeout};

fn config_error(text: &str) -> String {
    match parse_and_validate(text) {
        Err(JobflowError::ConfigError(msg)) => msg,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn empty_config_is_rejected() {
    let msg = config_error("");
    assert!(msg.contains("at least one"), "{msg}");
}

#[test]
fn unknown_dependency_is_rejected() {
    let msg = config_error(
        r#"
[workflow.w.task.a]
action = { type = "procedure", name = "noop" }
after = ["ghost"]
"#,
    );
    assert!(msg.contains("unknown dependency 'ghost'"), "{msg}");
}

#[test]
fn self_dependency_is_rejected() {
    let msg = config_error(
        r#"
[workflow.w.task.a]
action = { type = "procedure", name = "noop" }
after = ["a"]
"#,
    );
    assert!(msg.contains("cannot depend on itself"), "{msg}");
}

#[test]
fn cycle_is_reported_as_cycle() {
    let res = parse_and_validate(
        r#"
[workflow.w.task.a]
action = { type = "procedure", name = "noop" }
after = ["b"]

[workflow.w.task.b]
action = { type = "procedure", name = "noop" }
after_completion = ["a"]
"#,
    );
    assert!(matches!(res, Err(JobflowError::CycleDetected(_))), "{res:?}");
}

#[test]
fn standalone_task_cannot_have_dependencies() {
    let msg = config_error(
        r#"
[task.a]
action = { type = "shell", command = "true" }
after = ["b"]
"#,
    );
    assert!(msg.contains("not part of a workflow"), "{msg}");
}

#[test]
fn bad_cron_and_window_are_rejected() {
    let msg = config_error(
        r#"
[task.a]
action = { type = "shell", command = "true" }
cron = "every tuesday"
"#,
    );
    assert!(msg.contains("task 'a'"), "{msg}");

    let msg = config_error(
        r#"
[task.a]
action = { type = "shell", command = "true" }
window_start = "2030-01-02T00:00:00Z"
window_end = "2030-01-01T00:00:00Z"
"#,
    );
    assert!(msg.contains("window_start is after window_end"), "{msg}");
}

#[test]
fn actions_are_checked() {
    let msg = config_error(
        r#"
[task.a]
action = { type = "shell", command = "  " }
"#,
    );
    assert!(msg.contains("non-empty command"), "{msg}");

    let msg = config_error(
        r#"
[task.a]
action = { type = "http", method = "GE T", url = "http://localhost" }
"#,
    );
    assert!(msg.contains("invalid HTTP method"), "{msg}");
}

#[test]
fn downstream_must_name_another_workflow() {
    let msg = config_error(
        r#"
[workflow.w]
downstream = ["w"]

[workflow.w.task.a]
action = { type = "procedure", name = "noop" }
"#,
    );
    assert!(msg.contains("itself"), "{msg}");

    let msg = config_error(
        r#"
[workflow.w]
downstream = ["nope"]

[workflow.w.task.a]
action = { type = "procedure", name = "noop" }
"#,
    );
    assert!(msg.contains("unknown downstream workflow 'nope'"), "{msg}");
}

#[test]
fn zero_intervals_are_rejected() {
    let msg = config_error(
        r#"
[lock]
ttl_ms = 0

[task.a]
action = { type = "shell", command = "true" }
"#,
    );
    assert!(msg.contains("[lock].ttl_ms"), "{msg}");
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let res = parse_raw("[task.a\naction = 1");
    assert!(matches!(res, Err(JobflowError::TomlError(_))), "{res:?}");
}

#[test]
fn unknown_action_type_is_a_toml_error() {
    let res = parse_raw(
        r#"
[task.a]
action = { type = "carrier_pigeon" }
"#,
    );
    assert!(matches!(res, Err(JobflowError::TomlError(_))), "{res:?}");
}

#[test]
fn loads_from_disk_with_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[lock]
backend = "sql"

[task.hello]
action = {{ type = "shell", command = "echo hello" }}
"#
    )
    .unwrap();

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.lock.backend, LockBackend::Sql);
    assert_eq!(cfg.engine.poll_interval_ms, 1000);

    let hello = &cfg.task["hello"];
    assert!(hello.enabled);
    assert!(hello.notify_on_failure);
    assert_eq!(hello.timeout_ms, 300_000);
    assert!(matches!(hello.action, TaskKind::Shell { .. }));

    let options = cfg.engine_options();
    assert_eq!(options.lock_ttl.as_millis(), 30_000);
    assert!(options.instance_id.starts_with("jobflow-"));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let res = load_and_validate(dir.path().join("absent.toml"));
    assert!(matches!(res, Err(JobflowError::IoError(_))), "{res:?}");
}

#[tokio::test]
async fn catalog_installs_into_an_orchestrator() {
    init_tracing();
    let cfg = parse_and_validate(
        r#"
[workflow.etl.task.extract]
action = { type = "procedure", name = "noop" }

[workflow.etl.task.load]
action = { type = "procedure", name = "noop" }
after = ["extract"]
"#,
    )
    .unwrap();
    let catalog = Catalog::from_config(&cfg);
    let h = Harness::new();
    catalog.install(&h.orchestrator).await.unwrap();

    let etl = catalog.lookup("etl").unwrap();
    let ticket = h
        .orchestrator
        .execute_now(etl, jobflow::types::TriggerType::Manual)
        .await
        .unwrap();
    with_timeout(ticket.wait()).await.unwrap();

    let extract = catalog.lookup("etl.extract").unwrap();
    let load = catalog.lookup("etl.load").unwrap();
    assert_eq!(extract, Target::Task(TaskId(1)));
    assert_eq!(h.executor.executed(), vec![TaskId(1), TaskId(2)]);
    assert_eq!(load, Target::Task(TaskId(2)));
}
