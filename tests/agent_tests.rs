//! Executor tests and end-to-end runs through the bundled agent.


use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shovey::agent::{Agent, CommandExecutor, ExecutionStatus};
use shovey::bus::OutputStream;
use shovey::config::AgentConfig;
use shovey::dispatch::{JobStatus, RunState};
use shovey::signing::{EcdsaSigner, EnvelopeVerifier};
use test_harness::TestHarness;

const WAIT: Duration = Duration::from_secs(10);

fn test_executor() -> CommandExecutor {
    CommandExecutor::new("sh")
}

async fn drain(mut rx: mpsc::Receiver<(OutputStream, String)>) -> Vec<(OutputStream, String)> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.push(chunk);
    }
    out
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (tx, rx) = mpsc::channel(16);
    let job_id = Uuid::new_v4();

    let result = test_executor()
        .execute(job_id, "echo hello", WAIT, CancellationToken::new(), tx)
        .await;

    assert_eq!(result.job_id, job_id);
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.is_none());
    assert_eq!(
        drain(rx).await,
        vec![(OutputStream::Stdout, "hello\n".to_string())]
    );
}

#[tokio::test]
async fn test_execute_separates_streams() {
    let (tx, rx) = mpsc::channel(16);
    let result = test_executor()
        .execute(
            Uuid::new_v4(),
            "echo out; echo err >&2",
            WAIT,
            CancellationToken::new(),
            tx,
        )
        .await;

    assert_eq!(result.status, ExecutionStatus::Ok);
    let chunks = drain(rx).await;
    assert!(chunks.contains(&(OutputStream::Stdout, "out\n".to_string())));
    assert!(chunks.contains(&(OutputStream::Stderr, "err\n".to_string())));
}

#[tokio::test]
async fn test_execute_failing_command() {
    let (tx, _rx) = mpsc::channel(16);
    let result = test_executor()
        .execute(Uuid::new_v4(), "exit 3", WAIT, CancellationToken::new(), tx)
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    let report = result.into_report();
    assert!(!report.succeeded());
    assert_eq!(report.status, "failed");
}

#[tokio::test]
async fn test_execute_times_out() {
    let (tx, _rx) = mpsc::channel(16);
    let result = test_executor()
        .execute(
            Uuid::new_v4(),
            "sleep 10",
            Duration::from_millis(100),
            CancellationToken::new(),
            tx,
        )
        .await;

    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert!(result.exit_code.is_none());
}

#[tokio::test]
async fn test_execute_cancelled() {
    let (tx, _rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = test_executor()
        .execute(Uuid::new_v4(), "sleep 10", WAIT, cancel, tx)
        .await;
    assert_eq!(result.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_missing_shell_fails() {
    let (tx, _rx) = mpsc::channel(16);
    let result = CommandExecutor::new("/nonexistent/shell")
        .execute(Uuid::new_v4(), "true", WAIT, CancellationToken::new(), tx)
        .await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.is_some());
}

async fn start_agent(harness: &TestHarness, config: AgentConfig, verifier: EnvelopeVerifier) {
    let name = config.name.clone();
    let agent = Agent::new(config, harness.bus.clone(), verifier);
    tokio::spawn(agent.run(harness.shutdown_token()));

    // The first heartbeat goes out as soon as the agent starts
    let deadline = tokio::time::Instant::now() + WAIT;
    while !harness.monitor.is_up(&name).await {
        assert!(tokio::time::Instant::now() < deadline, "agent never came up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_agent_runs_job_end_to_end() {
    let harness = TestHarness::new().await;
    harness.pump_events();
    start_agent(&harness, AgentConfig::new("web1"), harness.verifier()).await;

    let job = harness.submit("echo one; echo two", &["web1"]).await;
    let view = harness
        .wait_for(job.id, WAIT, |v| v.status == JobStatus::Complete)
        .await;
    assert_eq!(view.nodes[0].state, RunState::Success);
    assert_eq!(view.nodes[0].exit_code, Some(0));

    // Output and reports travel on separate topics, so chunks may trail the report
    let deadline = tokio::time::Instant::now() + WAIT;
    let detail = loop {
        let detail = harness.dispatcher.run_detail(job.id, "web1").await.unwrap();
        if detail.run.chunks.len() == 2 {
            break detail;
        }
        assert!(tokio::time::Instant::now() < deadline, "output never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(detail.stdout, "one\ntwo\n");
    let sequences: Vec<u64> = detail.run.chunks.keys().copied().collect();
    assert_eq!(sequences, vec![1, 2]);
    let states: Vec<RunState> = detail.run.history.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![RunState::Created, RunState::Running, RunState::Success]
    );
}

#[tokio::test]
async fn test_agent_refuses_commands_outside_allow_list() {
    let harness = TestHarness::new().await;
    harness.pump_events();
    let config = AgentConfig::new("web1").with_allowed_command("uptime");
    start_agent(&harness, config, harness.verifier()).await;

    let job = harness.submit("rm -rf /tmp/data", &["web1"]).await;
    let view = harness
        .wait_for(job.id, WAIT, |v| v.status == JobStatus::Complete)
        .await;
    assert_eq!(view.nodes[0].state, RunState::Nacked);
    assert!(view.nodes[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("not allowed"));
}

#[tokio::test]
async fn test_agent_refuses_envelopes_from_other_keys() {
    let harness = TestHarness::new().await;
    harness.pump_events();
    let stranger = EnvelopeVerifier::new(EcdsaSigner::generate().verifying_key());
    start_agent(&harness, AgentConfig::new("web1"), stranger).await;

    let job = harness.submit("uptime", &["web1"]).await;
    let view = harness
        .wait_for(job.id, WAIT, |v| v.status == JobStatus::Complete)
        .await;
    assert_eq!(view.nodes[0].state, RunState::Nacked);
    assert!(view.nodes[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("signature"));
}

#[tokio::test]
async fn test_agent_stops_cancelled_job() {
    let harness = TestHarness::new().await;
    harness.pump_events();
    start_agent(&harness, AgentConfig::new("web1"), harness.verifier()).await;

    let job = harness.submit("sleep 30", &["web1"]).await;
    harness
        .wait_for(job.id, WAIT, |v| v.status == JobStatus::Running)
        .await;
    harness.dispatcher.cancel(job.id, None).await.unwrap();

    // The agent kills the process and its report arrives late
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let detail = harness.dispatcher.run_detail(job.id, "web1").await.unwrap();
        assert_eq!(detail.run.state, RunState::Cancelled);
        if let Some(late) = detail.run.late_reports.first() {
            assert_eq!(late.report.status, "cancelled");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "agent never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
