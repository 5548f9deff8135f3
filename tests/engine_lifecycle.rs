mod common;

use std::sync::Arc;

use common::{finish, start, test_config, wait_until};
use weft::interpreter::OperationSpec;
use weft::runtime::error::{ConfigError, DispatchError, EngineError};
use weft::runtime::session::SessionOutcome;
use weft::runtime::{ExecutionMode, Message, ServiceDefinition, init_tracing, load_config};
use weft::{Engine, EngineConfig, Node, Value};

fn idle_service() -> ServiceDefinition {
    ServiceDefinition::builder(
        "idle",
        Node::one_way(Arc::new(OperationSpec::one_way("wake")), None),
    )
    .build()
}

#[test]
fn invalid_config_is_rejected_at_start() {
    let config = EngineConfig {
        workers: 0,
        ..test_config()
    };
    match Engine::start(idle_service(), config) {
        Err(EngineError::Config(ConfigError::ZeroWorkers)) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("engine started without workers"),
    }

    let config = EngineConfig {
        quantum: 0,
        ..test_config()
    };
    assert_eq!(config.validate(), Err(ConfigError::ZeroQuantum));
}

#[test]
fn tracing_can_be_initialised_repeatedly() {
    let config = EngineConfig {
        debug: true,
        ..EngineConfig::default()
    };
    init_tracing(&config);
    init_tracing(&config);
}

#[test]
fn engine_starts_from_a_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "workers": 1, "quantum": 8 }"#).unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.workers, 1);
    assert_eq!(config.shutdown_timeout_ms, EngineConfig::default().shutdown_timeout_ms);

    let engine = Engine::start(idle_service(), config).unwrap();
    assert_eq!(engine.config().quantum, 8);
    assert_eq!(engine.service().name(), "idle");
}

#[test]
fn shutdown_kills_live_sessions_and_refuses_new_messages() {
    let mut engine = start(idle_service());
    let first = engine.spawn_session();
    let second = engine.spawn_session();
    assert!(wait_until(|| first.pending_operations() == ["wake"]
        && second.pending_operations() == ["wake"]));

    engine.shutdown();

    for handle in [&first, &second] {
        assert_eq!(finish(handle).outcome, SessionOutcome::Killed("shutdown".into()));
    }
    assert!(engine.live_sessions().is_empty());
    assert_eq!(
        engine.deliver(Message::request("wake", Value::new()), None),
        Err(DispatchError::ShuttingDown)
    );
    // a second shutdown is a no-op
    engine.shutdown();
}

#[test]
fn shutdown_drops_the_sequential_backlog() {
    let service = ServiceDefinition::builder(
        "sequential",
        Node::sequence(vec![
            Node::one_way(Arc::new(OperationSpec::one_way("start")), None),
            Node::one_way(Arc::new(OperationSpec::one_way("finish")), None),
        ]),
    )
    .mode(ExecutionMode::Sequential)
    .build();
    let mut engine = start(service);

    engine.deliver(Message::request("start", Value::new()), None).unwrap();
    engine.deliver(Message::request("start", Value::new()), None).unwrap();
    assert_eq!(engine.backlog(), 1);

    engine.shutdown();
    assert_eq!(engine.backlog(), 0);
    assert!(engine.live_sessions().is_empty());
}

#[test]
fn single_mode_starts_its_session_immediately() {
    let service = ServiceDefinition::builder("single", Node::null())
        .mode(ExecutionMode::Single)
        .build();
    let engine = start(service);
    // the only session may already be done, but it was started
    assert!(wait_until(|| engine.live_sessions().is_empty()));
    assert_eq!(
        engine.deliver(Message::request("anything", Value::new()), None),
        Err(DispatchError::UnknownOperation("anything".into()))
    );
}
