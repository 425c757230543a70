mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use mercurius::algorithm::{Algorithm, AlgorithmFunction};
use mercurius::repository::{ExecutionRepository, ExecutionStatus, InMemoryRepository, PeriodRepository};
use mercurius::session::command::{
    ConfigureExecutionReply, ControlReply, NewExecutionReply, PortfolioReply, CONFIGURE_EXECUTION, CURRENT_PORTFOLIO,
    NEW_EXECUTION, RUN_EXECUTION, STOP,
};
use mercurius::session::{Backtest, ExecutionPlan, ManualSession, SessionBuilder, SessionError};
use mercurius::socket::RequestOptions;
use mercurius::types::ExecutionId;
use serde_json::{json, Value};
use time::macros::date;
use tokio::task::JoinHandle;

fn backtest() -> Backtest {
    Backtest::new(
        date!(2024 - 01 - 01),
        date!(2024 - 01 - 05),
        vec!["ABC".to_string(), "BCD".to_string()],
        "SPY",
    )
}

fn new_execution_payload() -> Value {
    json!({
        "algorithm": {
            "functions": [
                {"name": "signal", "parallel": true},
                {"name": "rebalance", "run_last": true}
            ],
            "namespaces": ["signals"]
        }
    })
}

async fn manual(repo: &Arc<InMemoryRepository>) -> ManualSession {
    SessionBuilder::new(1, backtest())
        .with_config(common::config())
        .with_executions(Arc::clone(repo) as Arc<dyn ExecutionRepository>)
        .with_periods(Arc::clone(repo) as Arc<dyn PeriodRepository>)
        .manual()
        .await
        .unwrap()
}

fn start(session: ManualSession) -> (u16, JoinHandle<Result<(), SessionError>>) {
    let port = session.port();
    (port, tokio::spawn(session.run()))
}

async fn wait_for_status(repo: &InMemoryRepository, id: ExecutionId, status: ExecutionStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let record = repo.get(id).await.unwrap().unwrap();
        if record.status == status {
            return;
        }
        assert!(Instant::now() < deadline, "Execution stuck in {}", record.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_that_second_new_execution_is_rejected() {
    common::init_logging();
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let first = common::send(&control, NEW_EXECUTION, new_execution_payload()).await;
    assert!(first.error.is_none());
    let first: NewExecutionReply = first.parse().unwrap();
    assert_eq!(first.start, "2024-01-01");
    assert_eq!(first.symbols, vec!["ABC".to_string(), "BCD".to_string()]);

    let second = common::send(&control, NEW_EXECUTION, new_execution_payload()).await;
    assert!(second.error.unwrap().contains("already active"));
    assert_eq!(repo.list_by_session(1).await.unwrap().len(), 1);

    //The first execution can still be configured
    let configured = common::send(&control, CONFIGURE_EXECUTION, Value::Null).await;
    let configured: ConfigureExecutionReply = configured.parse().unwrap();
    assert_eq!(configured.execution_id, first.execution_id);

    common::send(&control, STOP, Value::Null).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_that_unknown_task_keeps_session_alive() {
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let reply = common::send(&control, "rebalance", Value::Null).await;
    assert_eq!(reply.error.as_deref(), Some("unknown task rebalance"));

    let reply = common::send(&control, CURRENT_PORTFOLIO, Value::Null).await;
    assert!(reply.error.is_none());
    let portfolio: PortfolioReply = reply.parse().unwrap();
    assert!(portfolio.portfolio.is_none());

    common::send(&control, STOP, Value::Null).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_that_run_before_configure_is_rejected() {
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let reply = common::send(&control, RUN_EXECUTION, Value::Null).await;
    assert!(reply.error.is_some());

    common::send(&control, NEW_EXECUTION, new_execution_payload()).await;
    let reply = common::send(&control, RUN_EXECUTION, Value::Null).await;
    assert!(reply.error.unwrap().contains("not valid while Configuring"));

    common::send(&control, STOP, Value::Null).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_that_execution_runs_to_completion_and_returns_to_idle() {
    common::init_logging();
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let created: NewExecutionReply = common::send(&control, NEW_EXECUTION, new_execution_payload())
        .await
        .parse()
        .unwrap();
    let configured: ConfigureExecutionReply = common::send(
        &control,
        CONFIGURE_EXECUTION,
        json!({"end": "2024-01-03", "benchmark": "QQQ"}),
    )
    .await
    .parse()
    .unwrap();
    assert_eq!(configured.functions.len(), 2);
    assert_eq!(configured.database_url, common::config().database_url);

    let _worker = common::spawn_worker(configured.broker_port, common::buy_each).await;

    let reply = common::send(&control, RUN_EXECUTION, Value::Null).await;
    assert!(reply.error.is_none());

    wait_for_status(&repo, created.execution_id, ExecutionStatus::Finished).await;
    let record = repo.get(created.execution_id).await.unwrap().unwrap();
    assert_eq!(record.benchmark, "QQQ");
    assert_eq!(record.end, date!(2024 - 01 - 03));

    let periods = repo.list_by_execution(created.execution_id).await.unwrap();
    assert_eq!(periods.len(), 3);

    //Idle again, so a new execution is accepted once the outcome has been handled
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let reply = common::send(&control, NEW_EXECUTION, new_execution_payload()).await;
        if reply.error.is_none() {
            break;
        }
        assert!(Instant::now() < deadline, "Session did not return to idle");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    common::send(&control, STOP, Value::Null).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_that_stop_token_ends_session_within_two_polls() {
    let repo = Arc::new(InMemoryRepository::new());
    let session = manual(&repo).await;
    let stop = session.stop_token();
    let (_, handle) = start(session);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let stopped_at = Instant::now();
    stop.cancel();

    let poll = common::config().poll_timeout;
    tokio::time::timeout(poll * 2, handle)
        .await
        .expect("session did not stop in time")
        .unwrap()
        .unwrap();
    assert!(stopped_at.elapsed() <= poll * 2);
}

#[tokio::test]
async fn test_that_stop_during_run_tears_down() {
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let created: NewExecutionReply = common::send(&control, NEW_EXECUTION, new_execution_payload())
        .await
        .parse()
        .unwrap();
    common::send(&control, CONFIGURE_EXECUTION, Value::Null).await;
    //No worker connects, so the run blocks in its first cycle until stopped
    common::send(&control, RUN_EXECUTION, Value::Null).await;

    let reply = common::send(&control, STOP, Value::Null).await;
    assert!(reply.error.is_none());
    tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();

    let record = repo.get(created.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_that_engine_configure_failure_ends_session() {
    let repo = Arc::new(InMemoryRepository::new());
    let session = SessionBuilder::new(4, backtest().with_initial_cash(0.0))
        .with_config(common::config())
        .with_executions(Arc::clone(&repo) as Arc<dyn ExecutionRepository>)
        .with_periods(Arc::clone(&repo) as Arc<dyn PeriodRepository>)
        .manual()
        .await
        .unwrap();
    let (port, session) = start(session);
    let control = common::control(port).await;

    let created: NewExecutionReply = common::send(&control, NEW_EXECUTION, new_execution_payload())
        .await
        .parse()
        .unwrap();
    common::send(&control, CONFIGURE_EXECUTION, Value::Null).await;

    //The caller is told why before the session goes away
    let reply = common::send(&control, RUN_EXECUTION, Value::Null).await;
    assert!(reply.error.unwrap().contains("initial cash must be positive"));

    let res = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("session did not end")
        .unwrap();
    assert!(matches!(res, Err(SessionError::EngineConfigure { .. })));

    let record = repo.get(created.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(repo.list_by_execution(created.execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_that_malformed_envelope_is_answered_and_session_continues() {
    let repo = Arc::new(InMemoryRepository::new());
    let (port, session) = start(manual(&repo).await);
    let control = common::control(port).await;

    let reply: ControlReply = control
        .request(
            &json!(42),
            RequestOptions::default().with_recv_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let error = reply.error.unwrap();
    assert!(error.starts_with("malformed request: "));

    let reply = common::send(&control, CURRENT_PORTFOLIO, Value::Null).await;
    assert!(reply.error.is_none());

    common::send(&control, STOP, Value::Null).await;
    session.await.unwrap().unwrap();
}

fn plan(functions: Vec<AlgorithmFunction>) -> ExecutionPlan {
    ExecutionPlan::new(Algorithm::new(functions, vec![]).unwrap())
}

#[tokio::test]
async fn test_that_automated_session_persists_every_execution() {
    let repo = Arc::new(InMemoryRepository::new());
    let session = SessionBuilder::new(2, backtest())
        .with_config(common::config())
        .with_executions(Arc::clone(&repo) as Arc<dyn ExecutionRepository>)
        .with_periods(Arc::clone(&repo) as Arc<dyn PeriodRepository>)
        .automated(vec![
            plan(vec![AlgorithmFunction::new("signal").parallel()]),
            plan(vec![AlgorithmFunction::new("rebalance")])
                .with_dates(date!(2024 - 01 - 02), date!(2024 - 01 - 03)),
        ])
        .await
        .unwrap();

    let (broker, _) = session.pool_ports();
    let _worker = common::spawn_worker(broker, common::buy_each).await;

    let ids = session.run().await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(repo.list_by_execution(ids[0]).await.unwrap().len(), 5);
    assert_eq!(repo.list_by_execution(ids[1]).await.unwrap().len(), 2);
    for id in ids {
        let record = repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Finished);
    }
}

#[tokio::test]
async fn test_that_automated_session_continues_after_failure() {
    let repo = Arc::new(InMemoryRepository::new());
    let session = SessionBuilder::new(3, backtest())
        .with_config(common::config())
        .with_executions(Arc::clone(&repo) as Arc<dyn ExecutionRepository>)
        .with_periods(Arc::clone(&repo) as Arc<dyn PeriodRepository>)
        .automated(vec![
            plan(vec![AlgorithmFunction::new("broken")]),
            plan(vec![AlgorithmFunction::new("signal")]),
        ])
        .await
        .unwrap();

    let (broker, _) = session.pool_ports();
    let _worker = common::spawn_worker(broker, |task| {
        if task.function == "broken" {
            return Err("broken function".to_string());
        }
        common::buy_each(task)
    })
    .await;

    let err = session.run().await.unwrap_err();
    assert!(matches!(err, SessionError::Execution { .. }));

    let records = repo.list_by_session(3).await.unwrap();
    let statuses: Vec<ExecutionStatus> = records.iter().map(|record| record.status).collect();
    assert_eq!(statuses, vec![ExecutionStatus::Failed, ExecutionStatus::Finished]);
    assert_eq!(repo.list_by_execution(records[1].id).await.unwrap().len(), 5);
}
