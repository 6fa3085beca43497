#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{ImportFailure, LoggingHooks};
use broker::MemoryBroker;
use common::{HookCall, MODEL_QUEUE, WORKER_QUEUE, Worker, within};
use dispatch_core::{ConfigError, CorrelationId, ImportDescriptor, JobState};
use futures_util::StreamExt;
use serde_json::json;
use service::{
    DispatchError, DispatchOutcome, ImportRequest, LogAlertNotifier, QueueService, ServiceError,
    ToyModelOptions,
};
use staging::StagingError;

#[tokio::test]
async fn import_round_trip_reaches_success_hook() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, MODEL_QUEUE).await?;
    let uploads = tempfile::tempdir()?;
    let upload = uploads.path().join("upload.tmp");
    std::fs::write(&upload, b"ifc bytes")?;

    let id = CorrelationId::new();
    let outcome = h
        .service
        .dispatcher()
        .import_file(
            id.clone(),
            ImportRequest::new(&upload, "a.ifc", "acme", "tower", "bob"),
        )
        .await?;
    assert_eq!(
        outcome,
        DispatchOutcome::Published {
            target: MODEL_QUEUE.to_string(),
            consumers: Some(1),
        }
    );

    let descriptor_path = h.shared.path().join(format!("{id}.json"));
    let job = within(worker.jobs.next()).await.unwrap();
    assert_eq!(
        String::from_utf8(job.data)?,
        format!("import -f {}", descriptor_path.display())
    );
    assert_eq!(job.correlation_id.as_deref(), Some(id.as_str()));
    let app_id = job.app_id.unwrap();
    assert_eq!(Some(app_id.as_str()), h.service.connection().uid().as_deref());

    let descriptor: ImportDescriptor = serde_json::from_slice(&std::fs::read(&descriptor_path)?)?;
    assert_eq!(descriptor.file, h.shared.path().join(id.as_str()).join("a.ifc"));
    assert_eq!(descriptor.database, "acme");
    assert_eq!(descriptor.project, "tower");
    assert_eq!(descriptor.owner, "bob");
    assert_eq!(std::fs::read(&descriptor.file)?, b"ifc bytes");
    assert!(!upload.exists());

    let processing = r#"{"status":"processing","database":"acme","project":"tower"}"#;
    worker.reply(&app_id, id.as_str(), processing).await?;
    assert_eq!(
        within(h.hooks.recv()).await,
        Some(HookCall::Status("acme".into(), "tower".into()))
    );

    worker
        .reply(
            &app_id,
            id.as_str(),
            r#"{"status":"done","value":0,"database":"acme","project":"tower"}"#,
        )
        .await?;
    assert_eq!(
        within(h.hooks.recv()).await,
        Some(HookCall::Success(
            "acme".into(),
            "tower".into(),
            h.shared.path().to_path_buf()
        ))
    );

    let tracked = h.service.listener().get_job(id).await?.unwrap();
    assert_eq!(tracked.state, JobState::Succeeded);
    assert_eq!(tracked.progress_updates, 1);
    Ok(())
}

#[tokio::test]
async fn failure_reply_reaches_failure_hook() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;

    let id = CorrelationId::new();
    h.service
        .dispatcher()
        .import_toy_model(id.clone(), "acme", "tower", ToyModelOptions::new("sample"))
        .await?;
    let job = within(worker.jobs.next()).await.unwrap();

    let failure = concat!(
        r#"{"value":4,"message":"bad geometry","#,
        r#""database":"acme","project":"tower","user":"bob"}"#,
    );
    worker
        .reply(job.app_id.as_deref().unwrap(), id.as_str(), failure)
        .await?;

    assert_eq!(
        within(h.hooks.recv()).await,
        Some(HookCall::Fail(ImportFailure {
            database: "acme".into(),
            project: "tower".into(),
            user: "bob".into(),
            code: 4,
            message: "bad geometry".into(),
            report: true,
        }))
    );
    let tracked = h.service.listener().get_job(id).await?.unwrap();
    assert_eq!(tracked.state, JobState::Failed { code: 4 });
    Ok(())
}

#[tokio::test]
async fn terminal_state_is_reached_once() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;

    let id = CorrelationId::new();
    h.service
        .dispatcher()
        .import_toy_model(id.clone(), "acme", "tower", ToyModelOptions::new("sample"))
        .await?;
    let app_id = within(worker.jobs.next()).await.unwrap().app_id.unwrap();

    for body in [
        r#"{"value":0,"database":"acme","project":"tower"}"#,
        r#"{"value":2,"database":"acme","project":"tower"}"#,
        r#"{"status":"processing","database":"acme","project":"tower"}"#,
    ] {
        worker.reply(&app_id, id.as_str(), body).await?;
    }

    assert!(matches!(within(h.hooks.recv()).await, Some(HookCall::Success(..))));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.hooks.try_recv().is_err());
    assert_eq!(
        h.service.listener().get_job(id).await?.unwrap().state,
        JobState::Succeeded
    );
    Ok(())
}

#[tokio::test]
async fn interleaved_replies_for_two_jobs_settle_independently() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;
    let dispatcher = h.service.dispatcher();

    let tower = CorrelationId::new();
    let bridge = CorrelationId::new();
    dispatcher
        .import_toy_model(tower.clone(), "acme", "tower", ToyModelOptions::new("sample"))
        .await?;
    dispatcher
        .import_toy_model(bridge.clone(), "acme", "bridge", ToyModelOptions::new("sample"))
        .await?;
    let app_id = within(worker.jobs.next()).await.unwrap().app_id.unwrap();
    within(worker.jobs.next()).await.unwrap();

    for (id, body) in [
        (&tower, r#"{"status":"processing","database":"acme","project":"tower"}"#),
        (&bridge, r#"{"value":0,"database":"acme","project":"bridge"}"#),
        (&tower, r#"{"value":2,"database":"acme","project":"tower"}"#),
    ] {
        worker.reply(&app_id, id.as_str(), body).await?;
    }

    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(within(h.hooks.recv()).await.unwrap());
    }
    let tower_status = HookCall::Status("acme".into(), "tower".into());
    let tower_fail = HookCall::Fail(ImportFailure {
        database: "acme".into(),
        project: "tower".into(),
        user: "unknown".into(),
        code: 2,
        message: String::new(),
        report: true,
    });
    let position = |call: &HookCall| calls.iter().position(|c| c == call);
    assert!(position(&tower_status) < position(&tower_fail));
    assert!(position(&tower_status).is_some());
    assert!(calls.iter().any(|c| matches!(
        c,
        HookCall::Success(database, project, _) if database == "acme" && project == "bridge"
    )));

    let listener = h.service.listener();
    assert_eq!(
        listener.get_job(tower).await?.unwrap().state,
        JobState::Failed { code: 2 }
    );
    assert_eq!(
        listener.get_job(bridge).await?.unwrap().state,
        JobState::Succeeded
    );
    Ok(())
}

#[tokio::test]
async fn federation_writes_definition_and_targets_worker_queue() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;
    let definition = json!({
        "database": "acme",
        "project": "fed1",
        "subProjects": [{ "database": "acme", "project": "tower" }],
    });

    let id = CorrelationId::new();
    let outcome = h
        .service
        .dispatcher()
        .create_federated_model(id.clone(), "acme", &definition)
        .await?;
    assert!(outcome.is_published());

    let path = h.shared.path().join(id.as_str()).join("obj.json");
    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    assert_eq!(written, definition);

    let job = within(worker.jobs.next()).await.unwrap();
    assert_eq!(
        String::from_utf8(job.data)?,
        format!("genFed {} acme", path.display())
    );
    Ok(())
}

#[tokio::test]
async fn toy_model_command_keeps_trailing_argument() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;
    let dispatcher = h.service.dispatcher();

    dispatcher
        .import_toy_model(CorrelationId::new(), "acme", "m1", ToyModelOptions::new("sample"))
        .await?;
    dispatcher
        .import_toy_model(
            CorrelationId::new(),
            "acme",
            "m2",
            ToyModelOptions::new("sample").with_skip(json!({"issues": true})),
        )
        .await?;

    let first = within(worker.jobs.next()).await.unwrap();
    assert_eq!(first.data, b"importToy acme m1 sample ");
    let second = within(worker.jobs.next()).await.unwrap();
    assert_eq!(
        String::from_utf8(second.data)?,
        r#"importToy acme m2 sample {"issues":true}"#
    );
    Ok(())
}

#[tokio::test]
async fn missing_consumer_raises_alert_but_still_publishes() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;

    let outcome = h
        .service
        .dispatcher()
        .import_toy_model(CorrelationId::new(), "acme", "m1", ToyModelOptions::new("sample"))
        .await?;

    assert_eq!(
        outcome,
        DispatchOutcome::Published {
            target: WORKER_QUEUE.to_string(),
            consumers: Some(0),
        }
    );
    assert_eq!(within(h.alerts.recv()).await.as_deref(), Some(WORKER_QUEUE));
    assert_eq!(h.broker.queue_depth(WORKER_QUEUE), 1);
    Ok(())
}

#[tokio::test]
async fn severed_connection_reconnects_once_per_dispatch() -> Result<(), Box<dyn Error>> {
    let mut h = common::start().await?;
    let old_uid = h.service.connection().uid().unwrap();

    h.broker.sever();
    assert!(!h.service.connection().is_connected());
    let mut worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;
    let attempts_before = h.broker.connect_attempts();

    let id = CorrelationId::new();
    let outcome = within(h.service.dispatcher().import_toy_model(
        id.clone(),
        "acme",
        "m1",
        ToyModelOptions::new("sample"),
    ))
    .await?;
    assert!(outcome.is_published());
    assert_eq!(h.broker.connect_attempts(), attempts_before + 1);

    // Replies reach the new connection's reply queue.
    let job = within(worker.jobs.next()).await.unwrap();
    let app_id = job.app_id.unwrap();
    assert_ne!(app_id.as_str(), &*old_uid);
    worker
        .reply(&app_id, id.as_str(), r#"{"value":0,"database":"acme","project":"m1"}"#)
        .await?;
    assert!(matches!(within(h.hooks.recv()).await, Some(HookCall::Success(..))));
    Ok(())
}

#[tokio::test]
async fn unreachable_broker_never_errors_the_caller() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    h.broker.set_available(false);
    h.broker.sever();
    let attempts_before = h.broker.connect_attempts();

    let id = CorrelationId::new();
    let outcome = within(h.service.dispatcher().import_toy_model(
        id.clone(),
        "acme",
        "m1",
        ToyModelOptions::new("sample"),
    ))
    .await?;

    assert!(matches!(outcome, DispatchOutcome::Dropped { .. }));
    assert_eq!(h.broker.connect_attempts(), attempts_before + 1);
    assert!(h.service.listener().get_job(id).await?.is_none());

    let event = dispatch_core::DomainEvent::model_created("sock", "acme", json!({}));
    assert!(!within(h.service.events().publish(&event)).await.is_published());
    assert_eq!(h.broker.connect_attempts(), attempts_before + 2);
    Ok(())
}

#[tokio::test]
async fn staging_failure_is_returned_and_nothing_is_published() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    let missing = h.shared.path().join("does-not-exist.ifc");

    let result = h
        .service
        .dispatcher()
        .import_file(
            CorrelationId::new(),
            ImportRequest::new(&missing, "a.ifc", "acme", "tower", "bob"),
        )
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Staging(StagingError::Io { .. }))
    ));
    assert_eq!(h.broker.queue_depth(MODEL_QUEUE), 0);
    Ok(())
}

#[tokio::test]
async fn same_file_name_for_two_jobs_lands_in_two_directories() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    let uploads = tempfile::tempdir()?;
    let (first, second) = (CorrelationId::new(), CorrelationId::new());

    for (id, content) in [(&first, "one"), (&second, "two")] {
        let upload = uploads.path().join(format!("{id}.tmp"));
        std::fs::write(&upload, content)?;
        h.service
            .dispatcher()
            .import_file(
                id.clone(),
                ImportRequest::new(&upload, "same name.ifc", "acme", "tower", "bob"),
            )
            .await?;
    }

    let staged = |id: &CorrelationId| h.shared.path().join(id.as_str()).join("same_name.ifc");
    assert_eq!(std::fs::read_to_string(staged(&first))?, "one");
    assert_eq!(std::fs::read_to_string(staged(&second))?, "two");
    Ok(())
}

#[tokio::test]
async fn jobs_without_replies_stay_pending() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    let _worker = Worker::attach(&h.broker, WORKER_QUEUE).await?;

    let id = CorrelationId::new();
    h.service
        .dispatcher()
        .import_toy_model(id.clone(), "acme", "m1", ToyModelOptions::new("sample"))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let tracked = h.service.listener().get_job(id).await?.unwrap();
    assert_eq!(tracked.state, JobState::Dispatched);
    assert!(!tracked.state.is_terminal());
    Ok(())
}

#[tokio::test]
async fn incomplete_config_fails_start_naming_the_field() {
    let shared = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();

    let result = QueueService::start(
        common::config(shared.path()).with_event_exchange(" "),
        Arc::new(broker.clone()),
        Arc::new(LoggingHooks),
        Arc::new(LogAlertNotifier),
    )
    .await;

    match result {
        Err(ServiceError::Config(ConfigError::Missing(field))) => {
            assert_eq!(field, "event_exchange")
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("start should fail"),
    }
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn shutdown_closes_the_connection() -> Result<(), Box<dyn Error>> {
    let h = common::start().await?;
    assert_eq!(h.broker.open_connections(), 1);

    h.service.shutdown().await;
    assert_eq!(h.broker.open_connections(), 0);
    Ok(())
}
