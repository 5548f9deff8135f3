mod common;

use std::sync::Arc;

use common::{RecordingReply, ScriptedPort, expr, finish, int_at, start, str_at, wait_until};
use weft::interpreter::{BasicType, ChoiceBranch, Expr, OperationSpec, Receive, fault};
use weft::runtime::error::DispatchError;
use weft::runtime::{CorrelationSet, Engine, ExecutionMode, Message, ServiceDefinition, SessionHandle};
use weft::{Node, Value};

fn op(name: &str) -> Arc<OperationSpec> {
    Arc::new(OperationSpec::one_way(name))
}

fn branch(operation: &str, body: Arc<Node>) -> ChoiceBranch {
    ChoiceBranch::new(Receive::one_way(op(operation), None), body)
}

fn single(main: Arc<Node>) -> (Engine, SessionHandle) {
    let service = ServiceDefinition::builder("single", main)
        .mode(ExecutionMode::Single)
        .build();
    let engine = start(service);
    let id = engine.live_sessions()[0];
    let handle = engine.session(id).unwrap();
    (engine, handle)
}

fn send(engine: &Engine, operation: &str) {
    engine
        .deliver(Message::request(operation, Value::new()), None)
        .unwrap();
}

fn pending(handle: &SessionHandle, expected: &[&str]) -> bool {
    wait_until(|| handle.pending_operations() == expected)
}

#[test]
fn choice_runs_only_the_matching_branch() {
    let (engine, handle) = single(Node::sequence(vec![
        Node::choice(vec![
            branch("op1", Node::assign("branch", Expr::value(1))),
            branch("op2", Node::assign("branch", Expr::value(2))),
        ]),
        Node::one_way(op("next"), None),
    ]));
    assert!(pending(&handle, &["op1", "op2"]));

    send(&engine, "op2");
    assert!(pending(&handle, &["next"]));

    // op1 is no longer registered: the message just waits in the inbox
    send(&engine, "op1");
    assert_eq!(handle.queued_messages(), 1);
    assert_eq!(int_at(&handle.state_snapshot(), "branch"), Some(2));

    send(&engine, "next");
    let report = finish(&handle);
    assert!(report.is_completed());
    assert_eq!(int_at(&report.state, "branch"), Some(2));
}

#[test]
fn queued_messages_are_matched_oldest_first() {
    let (engine, handle) = single(Node::sequence(vec![
        Node::one_way(op("gate"), None),
        Node::choice(vec![
            branch("a", Node::assign("branch", Expr::value("a"))),
            branch("b", Node::assign("branch", Expr::value("b"))),
        ]),
    ]));
    assert!(pending(&handle, &["gate"]));

    send(&engine, "b");
    send(&engine, "a");
    send(&engine, "gate");

    let report = finish(&handle);
    assert_eq!(str_at(&report.state, "branch").as_deref(), Some("b"));
}

#[test]
fn request_response_guard_replies_before_its_branch() {
    let ask = Arc::new(OperationSpec::request_response("ask"));
    let (engine, handle) = single(Node::choice(vec![
        ChoiceBranch::new(
            Receive::request_response(
                ask,
                Some("question".into()),
                expr(Expr::path("answer")),
                Node::assign("answer", Expr::value(42)),
            ),
            Node::assign("after_reply", Expr::value(true)),
        ),
        branch("ignore", Node::null()),
    ]));
    assert!(pending(&handle, &["ask", "ignore"]));

    let reply = RecordingReply::new();
    engine
        .deliver(Message::request("ask", "what?"), Some(reply.clone()))
        .unwrap();

    let responses = reply.wait_for(1);
    assert_eq!(responses[0].value.as_int(), Some(42));
    assert!(!responses[0].is_fault());

    let report = finish(&handle);
    assert_eq!(str_at(&report.state, "question").as_deref(), Some("what?"));
    assert_eq!(
        weft::VariablePath::from("after_reply").value_of(&report.state).as_bool(),
        Some(true)
    );
}

#[test]
fn provide_loops_until_the_until_branch_fires() {
    let (engine, handle) = single(Node::provide_until(
        vec![branch("add", Node::increment("count"))],
        vec![branch("stop", Node::assign("stopped", Expr::value(true)))],
    ));

    for _ in 0..3 {
        assert!(pending(&handle, &["add", "stop"]));
        send(&engine, "add");
        // each round trip re-registers the provide guard
    }
    assert!(wait_until(|| int_at(&handle.state_snapshot(), "count") == Some(3)));
    send(&engine, "stop");

    let report = finish(&handle);
    assert_eq!(int_at(&report.state, "count"), Some(3));
    assert_eq!(
        weft::VariablePath::from("stopped").value_of(&report.state).as_bool(),
        Some(true)
    );
}

#[test]
fn provide_body_may_wait_on_an_until_operation() {
    let (engine, handle) = single(Node::provide_until(
        vec![branch(
            "add",
            Node::sequence(vec![Node::one_way(op("stop"), None), Node::increment("count")]),
        )],
        vec![
            branch("stop", Node::assign("stopped", Expr::value(true))),
            branch("halt", Node::null()),
        ],
    ));

    assert!(pending(&handle, &["add", "halt", "stop"]));
    send(&engine, "add");
    // the body's receive takes over the until guard while it runs
    assert!(pending(&handle, &["stop"]));
    send(&engine, "stop");

    assert!(wait_until(|| int_at(&handle.state_snapshot(), "count") == Some(1)));
    assert!(pending(&handle, &["add", "halt", "stop"]));
    send(&engine, "stop");

    let report = finish(&handle);
    assert_eq!(int_at(&report.state, "count"), Some(1));
    assert_eq!(
        weft::VariablePath::from("stopped").value_of(&report.state).as_bool(),
        Some(true)
    );
}

#[test]
fn until_wins_over_queued_provide_message() {
    let (engine, handle) = single(Node::sequence(vec![
        Node::one_way(op("gate"), None),
        Node::provide_until(
            vec![branch("add", Node::increment("count"))],
            vec![branch("stop", Node::null())],
        ),
    ]));
    assert!(pending(&handle, &["gate"]));

    send(&engine, "add");
    send(&engine, "stop");
    send(&engine, "gate");

    let report = finish(&handle);
    assert!(report.is_completed());
    assert_eq!(int_at(&report.state, "count"), None);
}

#[test]
fn until_delivered_during_provide_body_ends_the_loop() {
    let (engine, handle) = single(Node::provide_until(
        vec![branch(
            "add",
            Node::sequence(vec![Node::increment("count"), Node::one_way(op("ack"), None)]),
        )],
        vec![branch("stop", Node::null())],
    ));
    assert!(pending(&handle, &["add", "stop"]));

    send(&engine, "add");
    assert!(pending(&handle, &["ack", "stop"]));
    send(&engine, "stop");
    // the provide guard is not registered while its body runs
    send(&engine, "add");
    assert!(wait_until(|| handle.queued_messages() == 1));
    send(&engine, "ack");

    let report = finish(&handle);
    assert!(report.is_completed());
    assert_eq!(int_at(&report.state, "count"), Some(1));
}

#[test]
fn dispatcher_rejects_unknown_and_mistyped_requests() {
    let typed = Arc::new(OperationSpec::request_response("typed").with_request(BasicType::Int));
    let main = Node::request_response(typed, Some("n".into()), None, Node::null());
    let engine = start(ServiceDefinition::builder("strict", main).build());

    let reply = RecordingReply::new();
    let err = engine
        .deliver(Message::request("missing", Value::new()), Some(reply.clone()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownOperation(_)));

    let err = engine
        .deliver(Message::request("typed", "not a number"), Some(reply.clone()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::TypeMismatch { .. }));

    let responses = reply.wait_for(2);
    let faults: Vec<&str> = responses
        .iter()
        .map(|response| response.fault.as_ref().map_or("", |fault| fault.name.as_str()))
        .collect();
    assert_eq!(faults, vec![fault::IO_EXCEPTION, fault::TYPE_MISMATCH]);
    assert!(engine.live_sessions().is_empty());
}

#[test]
fn uncorrelated_message_gets_correlation_error() {
    let main = Node::sequence(vec![
        Node::one_way(op("start"), None),
        Node::request_response(
            Arc::new(OperationSpec::request_response("status")),
            None,
            None,
            Node::null(),
        ),
    ]);
    let engine = start(ServiceDefinition::builder("busy", main).build());

    // two sessions, neither waiting for "status"
    let first = engine.spawn_session();
    let second = engine.spawn_session();
    assert!(wait_until(|| first.pending_operations() == ["start"]
        && second.pending_operations() == ["start"]));

    let reply = RecordingReply::new();
    let err = engine
        .deliver(Message::request("status", Value::new()), Some(reply.clone()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::Uncorrelated(_)));
    assert_eq!(reply.wait_for(1)[0].fault.as_ref().map(|f| f.name.as_str()), Some(fault::CORRELATION_ERROR));
}

#[test]
fn correlation_set_routes_to_the_owning_session() {
    let main = Node::sequence(vec![
        Node::one_way(op("login"), Some("user".into())),
        Node::one_way(op("ping"), Some("ping".into())),
    ]);
    let service = ServiceDefinition::builder("correlated", main)
        .correlation(CorrelationSet::new("user").alias("ping", "user"))
        .build();
    let engine = start(service);

    let alice = engine
        .deliver(Message::request("login", "alice"), None)
        .unwrap()
        .unwrap();
    let bob = engine
        .deliver(Message::request("login", "bob"), None)
        .unwrap()
        .unwrap();
    let alice_handle = engine.session(alice).unwrap();
    let bob_handle = engine.session(bob).unwrap();
    assert!(wait_until(|| str_at(&bob_handle.state_snapshot(), "user").as_deref() == Some("bob")));
    assert!(wait_until(|| str_at(&alice_handle.state_snapshot(), "user").as_deref() == Some("alice")));

    let routed = engine
        .deliver(
            Message::request("ping", Value::new().with_child("user", "bob").with_child("n", 2)),
            None,
        )
        .unwrap();
    assert_eq!(routed, Some(bob));

    let report = finish(&bob_handle);
    assert_eq!(int_at(&report.state, "ping.n"), Some(2));
    assert!(!alice_handle.is_done());

    let err = engine
        .deliver(Message::request("ping", Value::new().with_child("user", "carol")), None)
        .unwrap_err();
    assert!(matches!(err, DispatchError::Uncorrelated(_)));
}

#[test]
fn sequential_mode_runs_one_session_at_a_time() {
    let main = Node::sequence(vec![
        Node::one_way(op("start"), Some("who".into())),
        Node::one_way(op("finish"), None),
    ]);
    let service = ServiceDefinition::builder("sequential", main)
        .mode(ExecutionMode::Sequential)
        .build();
    let engine = start(service);

    let first = engine
        .deliver(Message::request("start", "one"), None)
        .unwrap()
        .unwrap();
    assert_eq!(engine.deliver(Message::request("start", "two"), None).unwrap(), None);
    assert_eq!(engine.backlog(), 1);
    assert_eq!(engine.live_sessions(), vec![first]);

    let first_handle = engine.session(first).unwrap();
    assert!(wait_until(|| first_handle.pending_operations() == ["finish"]));
    send(&engine, "finish");
    assert!(finish(&first_handle).is_completed());

    assert!(wait_until(|| engine.live_sessions().len() == 1 && engine.backlog() == 0));
    let second = engine.session(engine.live_sessions()[0]).unwrap();
    assert!(wait_until(|| str_at(&second.state_snapshot(), "who").as_deref() == Some("two")));
}

#[test]
fn sequential_backlog_drains_in_arrival_order() {
    let log = ScriptedPort::silent("log");
    let main = Node::sequence(vec![
        Node::one_way(op("start"), Some("n".into())),
        Node::notification("log", op("ran"), expr(Expr::path("n"))),
    ]);
    let service = ServiceDefinition::builder("sequential", main)
        .mode(ExecutionMode::Sequential)
        .output_port(log.clone())
        .build();
    let engine = start(service);

    // sessions finish while later starters are still arriving
    for n in 0..60i64 {
        engine.deliver(Message::request("start", n), None).unwrap();
    }

    assert!(wait_until(|| log.channel.sent().len() == 60));
    let order: Vec<Option<i64>> = log.channel.sent().iter().map(|m| m.value.as_int()).collect();
    assert_eq!(order, (0..60).map(Some).collect::<Vec<_>>());
    assert!(wait_until(|| engine.live_sessions().is_empty()));
    assert_eq!(engine.backlog(), 0);
}
