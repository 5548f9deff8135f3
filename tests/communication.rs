mod common;

use std::sync::Arc;

use common::{RecordingReply, ScriptedPort, expr, finish, int_at, start, str_at, test_config, wait_until};
use weft::interpreter::{BasicType, BinaryOp, Expr, OperationSpec, fault};
use weft::runtime::error::EngineError;
use weft::runtime::monitor::{EventKind, EventStatus};
use weft::runtime::session::SessionOutcome;
use weft::runtime::{Engine, ExecutionMode, Message, RecordingMonitor, ServiceDefinition, SessionHandle};
use weft::{Fault, Node, Value, VariablePath};

fn get_temp() -> Arc<OperationSpec> {
    Arc::new(
        OperationSpec::request_response("getTemp")
            .with_request(BasicType::String)
            .with_response(BasicType::Double)
            .with_fault("CityNotFound"),
    )
}

/// getTemp@weather("Rome")(temp) [ installed = true ]
fn weather_client(port: &ScriptedPort) -> ServiceDefinition {
    let main = Node::solicit_response(
        "weather",
        get_temp(),
        expr(Expr::value("Rome")),
        Some("temp".into()),
        Some(Node::assign("installed", Expr::value(true))),
    );
    ServiceDefinition::builder("client", main)
        .output_port(port.clone())
        .build()
}

#[test]
fn solicit_binds_the_response_and_sends_once() {
    let weather = ScriptedPort::new("weather", |request| Some(Message::response(request, 23.0)));
    let engine = start(weather_client(&weather));

    let report = finish(&engine.spawn_session());
    assert!(report.is_completed());
    assert_eq!(
        VariablePath::from("temp").value_of(&report.state).as_double(),
        Some(23.0)
    );
    assert_eq!(
        VariablePath::from("installed").value_of(&report.state).as_bool(),
        Some(true)
    );

    let sent = weather.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].operation, "getTemp");
    assert_eq!(sent[0].value.as_str(), Some("Rome"));
}

#[test]
fn solicit_waits_for_a_late_response() {
    let weather = ScriptedPort::silent("weather");
    let engine = start(weather_client(&weather));
    let handle = engine.spawn_session();

    assert!(wait_until(|| weather.channel.sent().len() == 1));
    assert!(!handle.is_done());

    let request = weather.channel.sent()[0].clone();
    weather.channel.respond(Message::response(&request, 18.5));

    let report = finish(&handle);
    assert_eq!(
        VariablePath::from("temp").value_of(&report.state).as_double(),
        Some(18.5)
    );
    assert_eq!(weather.channel.sent().len(), 1);
}

#[test]
fn declared_fault_reply_is_raised_in_the_caller() {
    let weather = ScriptedPort::new("weather", |request| {
        Some(Message::fault_response(request, Fault::with_value("CityNotFound", "Atlantis")))
    });
    let engine = start(weather_client(&weather));

    let report = finish(&engine.spawn_session());
    assert_eq!(report.fault_name(), Some("CityNotFound"));
    assert_eq!(
        VariablePath::from("installed").get(&report.state),
        None
    );
}

#[test]
fn undeclared_fault_reply_is_raised_unchanged() {
    let weather = ScriptedPort::new("weather", |request| {
        Some(Message::fault_response(request, Fault::with_value("Meltdown", "core")))
    });
    let engine = start(weather_client(&weather));

    let report = finish(&engine.spawn_session());
    assert_eq!(report.fault_name(), Some("Meltdown"));
    assert_eq!(
        VariablePath::from("installed").get(&report.state),
        None
    );
}

#[test]
fn declared_fault_with_mistyped_value_becomes_type_mismatch() {
    let strict = Arc::new(
        OperationSpec::request_response("getTemp")
            .with_response(BasicType::Double)
            .with_typed_fault("CityNotFound", BasicType::Int),
    );
    let weather = ScriptedPort::new("weather", |request| {
        Some(Message::fault_response(request, Fault::with_value("CityNotFound", "Atlantis")))
    });
    let main = Node::solicit_response("weather", strict, expr(Expr::value("Rome")), None, None);
    let engine = start(
        ServiceDefinition::builder("client", main)
            .output_port(weather)
            .build(),
    );

    assert_eq!(
        finish(&engine.spawn_session()).fault_name(),
        Some(fault::TYPE_MISMATCH)
    );
}

#[test]
fn killed_solicit_stops_waiting_for_its_response() {
    let weather = ScriptedPort::silent("weather");
    let engine = start(weather_client(&weather));
    let handle = engine.spawn_session();

    assert!(wait_until(|| weather.channel.sent().len() == 1 && weather.channel.waiting() > 0));
    handle.kill(Fault::new("Cancelled"));

    assert!(matches!(finish(&handle).outcome, SessionOutcome::Killed(_)));
    assert_eq!(weather.channel.waiting(), 0);
}

#[test]
fn mistyped_response_raises_type_mismatch() {
    let weather = ScriptedPort::new("weather", |request| Some(Message::response(request, "warm")));
    let engine = start(weather_client(&weather));

    let report = finish(&engine.spawn_session());
    assert_eq!(report.fault_name(), Some(fault::TYPE_MISMATCH));
    assert_eq!(
        VariablePath::from("installed").get(&report.state),
        None
    );
}

#[test]
fn mistyped_request_is_never_sent() {
    let weather = ScriptedPort::silent("weather");
    let main = Node::solicit_response("weather", get_temp(), expr(Expr::value(42)), None, None);
    let engine = start(
        ServiceDefinition::builder("client", main)
            .output_port(weather.clone())
            .build(),
    );

    let report = finish(&engine.spawn_session());
    assert_eq!(report.fault_name(), Some(fault::TYPE_MISMATCH));
    assert!(weather.channel.sent().is_empty());
}

#[test]
fn notification_sends_the_payload() {
    let audit = ScriptedPort::silent("audit");
    let main = Node::sequence(vec![
        Node::assign("entry.user", Expr::value("ada")),
        Node::notification(
            "audit",
            Arc::new(OperationSpec::one_way("record")),
            expr(Expr::path("entry")),
        ),
        Node::assign("after", Expr::value(1)),
    ]);
    let engine = start(
        ServiceDefinition::builder("notifier", main)
            .output_port(audit.clone())
            .build(),
    );

    let report = finish(&engine.spawn_session());
    assert!(report.is_completed());
    assert_eq!(int_at(&report.state, "after"), Some(1));

    let sent = audit.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(str_at(&sent[0].value, "user").as_deref(), Some("ada"));
}

#[test]
fn transport_failures_raise_io_exception() {
    let broken = ScriptedPort::failing("audit");
    let record = Arc::new(OperationSpec::one_way("record"));
    let failing = Node::notification("audit", Arc::clone(&record), None);
    let engine = start(
        ServiceDefinition::builder("notifier", failing)
            .output_port(broken)
            .build(),
    );
    assert_eq!(
        finish(&engine.spawn_session()).fault_name(),
        Some(fault::IO_EXCEPTION)
    );

    let missing = Node::notification("nowhere", record, None);
    let engine = start(ServiceDefinition::builder("notifier", missing).build());
    assert_eq!(
        finish(&engine.spawn_session()).fault_name(),
        Some(fault::IO_EXCEPTION)
    );
}

fn divide() -> Arc<OperationSpec> {
    Arc::new(
        OperationSpec::request_response("divide")
            .with_response(BasicType::Int)
            .with_fault("DivisionByZero"),
    )
}

/// Single-mode server, so the session exists before the request arrives.
fn request_response_server(body: Arc<Node>, output: Expr) -> (Engine, SessionHandle) {
    let main = Node::request_response(divide(), Some("request".into()), expr(output), body);
    let engine = start(
        ServiceDefinition::builder("calculator", main)
            .mode(ExecutionMode::Single)
            .build(),
    );
    let handle = engine.session(engine.live_sessions()[0]).unwrap();
    (engine, handle)
}

fn call(engine: &Engine, payload: Value) -> Message {
    let reply = RecordingReply::new();
    engine
        .deliver(Message::request("divide", payload), Some(reply.clone()))
        .unwrap();
    reply.wait_for(1).remove(0)
}

#[test]
fn request_response_replies_with_the_output() {
    let (engine, handle) = request_response_server(
        Node::assign(
            "result",
            Expr::binary(BinaryOp::Div, Expr::path("request.a"), Expr::path("request.b")),
        ),
        Expr::path("result"),
    );
    let response = call(&engine, Value::new().with_child("a", 84).with_child("b", 2));

    assert!(!response.is_fault());
    assert_eq!(response.value.as_int(), Some(42));
    assert!(finish(&handle).is_completed());
}

#[test]
fn declared_fault_is_sent_as_the_reply() {
    let (engine, handle) = request_response_server(
        Node::throw("DivisionByZero", expr(Expr::value("b is zero"))),
        Expr::path("result"),
    );
    let response = call(&engine, Value::new());

    let fault = response.fault.as_ref().unwrap();
    assert_eq!(fault.name, "DivisionByZero");
    assert_eq!(fault.value.as_str(), Some("b is zero"));
    assert_eq!(finish(&handle).fault_name(), Some("DivisionByZero"));
}

#[test]
fn undeclared_fault_is_hidden_behind_type_mismatch() {
    let (engine, handle) = request_response_server(Node::throw("DatabaseDown", None), Expr::path("result"));
    let response = call(&engine, Value::new());

    let fault = response.fault.as_ref().unwrap();
    assert_eq!(fault.name, fault::TYPE_MISMATCH);
    assert_eq!(fault.value.as_str(), Some("Internal server error"));
    // the caller sees a generic error, the session keeps the real fault
    assert_eq!(finish(&handle).fault_name(), Some("DatabaseDown"));
}

#[test]
fn mistyped_response_is_replaced_and_raised() {
    let (engine, handle) = request_response_server(Node::null(), Expr::value("not an int"));
    let response = call(&engine, Value::new());
    let report = finish(&handle);

    let fault = response.fault.as_ref().unwrap();
    assert_eq!(fault.name, fault::TYPE_MISMATCH);
    assert_eq!(fault.value.as_str(), Some("Internal server error (TypeMismatch)"));
    assert_eq!(report.fault_name(), Some(fault::TYPE_MISMATCH));
}

#[test]
fn killed_request_response_still_replies() {
    let wait = Arc::new(OperationSpec::one_way("never"));
    let (engine, handle) = request_response_server(Node::one_way(wait, None), Expr::path("result"));
    let reply = RecordingReply::new();
    engine
        .deliver(Message::request("divide", Value::new()), Some(reply.clone()))
        .unwrap();
    assert!(wait_until(|| handle.pending_operations() == ["never"]));
    let id = handle.id();

    assert!(engine.kill_session(id, Fault::new("Cancelled")));
    let responses = reply.wait_for(1);
    assert_eq!(responses[0].fault.as_ref().map(|f| f.name.as_str()), Some(fault::TYPE_MISMATCH));
    finish(&handle);
}

#[test]
fn local_port_connects_two_engines() {
    let double = Arc::new(OperationSpec::request_response("double").with_response(BasicType::Int));
    let server = start(ServiceDefinition::builder(
        "doubler",
        Node::request_response(
            Arc::clone(&double),
            Some("n".into()),
            expr(Expr::path("result")),
            Node::assign("result", Expr::binary(BinaryOp::Mul, Expr::path("n"), Expr::value(2))),
        ),
    )
    .build());

    let client = start(
        ServiceDefinition::builder(
            "client",
            Node::solicit_response("calc", double, expr(Expr::value(21)), Some("answer".into()), None),
        )
        .output_port(server.local_port("calc"))
        .build(),
    );

    let report = finish(&client.spawn_session());
    assert!(report.is_completed());
    assert_eq!(int_at(&report.state, "answer"), Some(42));
}

#[test]
fn local_port_reports_rejection_as_io_exception() {
    let server = start(ServiceDefinition::builder(
        "empty",
        Node::one_way(Arc::new(OperationSpec::one_way("ping")), None),
    )
    .build());

    let client = start(
        ServiceDefinition::builder(
            "client",
            Node::notification("remote", Arc::new(OperationSpec::one_way("unknown")), None),
        )
        .output_port(server.local_port("remote"))
        .build(),
    );

    assert_eq!(
        finish(&client.spawn_session()).fault_name(),
        Some(fault::IO_EXCEPTION)
    );
}

#[test]
fn rejected_local_solicit_leaves_nothing_in_flight() {
    let server = start(ServiceDefinition::builder(
        "empty",
        Node::one_way(Arc::new(OperationSpec::one_way("ping")), None),
    )
    .build());
    let port = server.local_port("remote");
    let client = start(
        ServiceDefinition::builder(
            "client",
            Node::solicit_response(
                "remote",
                Arc::new(OperationSpec::request_response("unknown")),
                None,
                Some("answer".into()),
                None,
            ),
        )
        .output_port(port.clone())
        .build(),
    );

    for _ in 0..3 {
        assert_eq!(
            finish(&client.spawn_session()).fault_name(),
            Some(fault::IO_EXCEPTION)
        );
    }
    assert_eq!(port.in_flight(), 0);
}

#[test]
fn killed_local_solicit_drops_the_late_response() {
    let slow = Arc::new(OperationSpec::request_response("slow"));
    let release = Arc::new(OperationSpec::one_way("release"));
    let server = start(
        ServiceDefinition::builder(
            "slow-server",
            Node::request_response(Arc::clone(&slow), None, None, Node::one_way(release, None)),
        )
        .mode(ExecutionMode::Single)
        .build(),
    );
    let server_session = server.session(server.live_sessions()[0]).unwrap();
    let port = server.local_port("remote");
    let client = start(
        ServiceDefinition::builder(
            "client",
            Node::solicit_response("remote", slow, None, Some("answer".into()), None),
        )
        .output_port(port.clone())
        .build(),
    );

    let handle = client.spawn_session();
    assert!(wait_until(|| server_session.pending_operations() == ["release"]));
    assert_eq!(port.in_flight(), 1);
    handle.kill(Fault::new("Cancelled"));
    assert!(matches!(finish(&handle).outcome, SessionOutcome::Killed(_)));
    assert_eq!(port.in_flight(), 0);

    // the server still answers, but nobody waits for it any more
    server.deliver(Message::request("release", Value::new()), None).unwrap();
    assert!(finish(&server_session).is_completed());
    assert_eq!(port.in_flight(), 0);
}

#[test]
fn monitor_records_operation_milestones() {
    let monitor = Arc::new(RecordingMonitor::new());
    let weather = ScriptedPort::new("weather", |request| Some(Message::response(request, 23.0)));
    let engine = Engine::builder(weather_client(&weather))
        .config(test_config())
        .monitor(monitor.clone())
        .start()
        .unwrap();

    finish(&engine.spawn_session());

    let calls = monitor.matching(EventKind::OperationCall, "getTemp");
    let replies = monitor.matching(EventKind::OperationReply, "getTemp");
    assert_eq!(calls.len(), 1);
    assert_eq!(replies.len(), 1);
    assert_eq!(calls[0].status, EventStatus::Success);
    assert_eq!(replies[0].message_id, calls[0].message_id);

    let server_monitor = Arc::new(RecordingMonitor::new());
    let server = Engine::builder(ServiceDefinition::builder(
        "calculator",
        Node::request_response(divide(), None, expr(Expr::value(1)), Node::null()),
    )
    .build())
    .config(test_config())
    .monitor(server_monitor.clone())
    .start()
    .unwrap();
    let reply = RecordingReply::new();
    server
        .deliver(Message::request("divide", Value::new()), Some(reply.clone()))
        .unwrap();
    reply.wait_for(1);

    assert!(wait_until(|| server_monitor.matching(EventKind::OperationEnded, "divide").len() == 1));
    assert_eq!(server_monitor.matching(EventKind::OperationStarted, "divide").len(), 1);
}

#[test]
fn init_state_seeds_every_session() {
    let main = Node::assign(
        "message",
        Expr::binary(BinaryOp::Add, Expr::path("greeting"), Expr::value(", world")),
    );
    let service = ServiceDefinition::builder("greeter", main)
        .init(Node::assign("greeting", Expr::value("hello")))
        .build();
    let engine = start(service);

    for _ in 0..2 {
        let report = finish(&engine.spawn_session());
        assert_eq!(str_at(&report.state, "message").as_deref(), Some("hello, world"));
    }
}

#[test]
fn failing_init_aborts_startup() {
    let service = ServiceDefinition::builder("broken", Node::null())
        .init(Node::throw("NoDatabase", None))
        .build();

    match Engine::start(service, test_config()) {
        Err(EngineError::Init(detail)) => assert!(detail.contains("NoDatabase")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("engine started despite a failing init"),
    }
}
