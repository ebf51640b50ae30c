use super::*;
use crate::{sessions::Frame, validation::INVALID_NAME};
use shared::{
    domain::{FactoryId, Root},
    protocol::{AddFactoryRequest, BoundInput, DeleteFactoryRequest, RegenFactoryNodesRequest},
};
use tokio::sync::mpsc::UnboundedReceiver;

async fn setup(config: EngineConfig) -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.ensure_root().await.expect("root");
    ApiContext::new(storage, config)
}

fn decode(frame: Frame) -> ServerEvent {
    serde_json::from_str(&frame).expect("server event")
}

fn next_event(rx: &mut UnboundedReceiver<Frame>) -> Option<ServerEvent> {
    rx.try_recv().ok().map(decode)
}

fn expect_tree(rx: &mut UnboundedReceiver<Frame>) -> Root {
    match next_event(rx) {
        Some(ServerEvent::Tree { root }) => root,
        other => panic!("expected tree, got {other:?}"),
    }
}

fn add_speed() -> ClientRequest {
    ClientRequest::AddFactory(AddFactoryRequest {
        name: "Speed".into(),
        lower_bound: BoundInput::Int(-10),
        upper_bound: BoundInput::Int(10),
        num_children: 3,
    })
}

#[tokio::test]
async fn connect_sends_tree_only_to_new_session() {
    let ctx = setup(EngineConfig::default()).await;
    let (_existing, mut existing_rx) = ctx.sessions.register().await;
    let (fresh, mut fresh_rx) = ctx.sessions.register().await;

    on_connect(&ctx, fresh).await.expect("connect");

    let root = expect_tree(&mut fresh_rx);
    assert_eq!(root.id, shared::domain::ROOT_ID);
    assert!(root.factories.is_empty());
    assert!(next_event(&mut existing_rx).is_none());
}

#[tokio::test]
async fn committed_mutation_is_broadcast_to_every_session() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    let outcome = dispatch(&ctx, sender, add_speed()).await.expect("dispatch");
    assert_eq!(outcome, Outcome::Committed);

    for rx in [&mut sender_rx, &mut other_rx] {
        let root = expect_tree(rx);
        assert_eq!(root.factories.len(), 1);
        assert_eq!(root.factories[0].nodes.len(), 3);
        assert!(next_event(rx).is_none());
    }
}

#[tokio::test]
async fn validation_error_goes_only_to_sender() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    let request = ClientRequest::AddFactory(AddFactoryRequest {
        name: "".into(),
        lower_bound: BoundInput::Int(0),
        upper_bound: BoundInput::Int(5),
        num_children: 2,
    });
    dispatch(&ctx, sender, request).await.expect("dispatch");

    match next_event(&mut sender_rx) {
        Some(ServerEvent::ValidationError(message)) => assert_eq!(message, INVALID_NAME),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(next_event(&mut other_rx).is_none());
    assert!(ctx.storage.fetch_tree().await.expect("tree").factories.is_empty());
}

#[tokio::test]
async fn ignored_requests_are_silent_by_default() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    dispatch(&ctx, sender, add_speed()).await.expect("add");
    let created = expect_tree(&mut sender_rx).factories.remove(0);
    let _ = expect_tree(&mut other_rx);

    let requests = [
        ClientRequest::RegenFactoryNodes(RegenFactoryNodesRequest {
            id: created.id,
            num_children: 16,
        }),
        ClientRequest::DeleteFactory(DeleteFactoryRequest { id: FactoryId(404) }),
    ];
    for request in requests {
        let outcome = dispatch(&ctx, sender, request).await.expect("dispatch");
        assert!(matches!(outcome, Outcome::Ignored(_)));
    }

    assert!(next_event(&mut sender_rx).is_none());
    assert!(next_event(&mut other_rx).is_none());
    let tree = ctx.storage.fetch_tree().await.expect("tree");
    assert_eq!(tree.factories, vec![created]);
}

#[tokio::test]
async fn ignored_requests_notify_sender_when_enabled() {
    let ctx = setup(EngineConfig {
        notify_rejections: true,
        ..EngineConfig::default()
    })
    .await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    dispatch(
        &ctx,
        sender,
        ClientRequest::DeleteFactory(DeleteFactoryRequest { id: FactoryId(404) }),
    )
    .await
    .expect("dispatch");

    match next_event(&mut sender_rx) {
        Some(ServerEvent::Error(err)) => assert_eq!(err.code, ErrorCode::NotFound),
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(next_event(&mut other_rx).is_none());
}

#[tokio::test]
async fn malformed_frames_get_a_distinct_error() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;

    for frame in [
        "not json",
        r#"{"type":"addFactory","payload":{"name":"Speed"}}"#,
        r#"{"type":"launch","payload":{}}"#,
        r#"{"type":"deleteFactory","payload":{"id":"seven"}}"#,
    ] {
        handle_frame(&ctx, sender, frame).await;
        match next_event(&mut sender_rx) {
            Some(ServerEvent::Error(err)) => assert_eq!(err.code, ErrorCode::MalformedRequest),
            other => panic!("expected malformed request error, got {other:?}"),
        }
    }
    assert!(ctx.storage.fetch_tree().await.expect("tree").factories.is_empty());
}

#[tokio::test]
async fn well_formed_frame_is_applied() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;

    handle_frame(
        &ctx,
        sender,
        r#"{"type":"addFactory","payload":{"name":"Speed","lowerBound":"-10","upperBound":"10","numChildren":3}}"#,
    )
    .await;

    let root = expect_tree(&mut sender_rx);
    assert_eq!(root.factories[0].name, "Speed");
    assert_eq!(root.factories[0].nodes.len(), 3);
}

#[tokio::test]
async fn persistence_failure_is_reported_to_sender_only() {
    let ctx = setup(EngineConfig::default()).await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    ctx.storage.pool().close().await;
    handle_request(&ctx, sender, add_speed()).await;

    match next_event(&mut sender_rx) {
        Some(ServerEvent::Error(err)) => assert_eq!(err.code, ErrorCode::Internal),
        other => panic!("expected internal error, got {other:?}"),
    }
    assert!(next_event(&mut other_rx).is_none());
}

#[tokio::test]
async fn stalled_persistence_times_out() {
    let ctx = setup(EngineConfig {
        persistence_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    })
    .await;
    let (sender, _sender_rx) = ctx.sessions.register().await;

    // The in-memory pool has a single connection; holding it stalls every
    // other storage call.
    let held = ctx.storage.pool().acquire().await.expect("connection");
    let err = dispatch(&ctx, sender, add_speed())
        .await
        .expect_err("should time out");
    assert!(matches!(err, DispatchError::Timeout(_)));
    drop(held);

    assert!(ctx.storage.fetch_tree().await.expect("tree").factories.is_empty());
}

#[tokio::test]
async fn committed_mutation_is_broadcast_after_a_slow_emission() {
    let ctx = setup(EngineConfig {
        persistence_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    })
    .await;
    let (sender, mut sender_rx) = ctx.sessions.register().await;
    let (_other, mut other_rx) = ctx.sessions.register().await;

    // Another emission is in flight for longer than the persistence budget.
    let in_flight = ctx.broadcaster.emit_lock.lock().await;
    let pending = {
        let ctx = ctx.clone();
        tokio::spawn(async move { dispatch(&ctx, sender, add_speed()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(ctx.storage.fetch_tree().await.expect("tree").factories.len(), 1);
    assert!(next_event(&mut sender_rx).is_none());
    drop(in_flight);

    let outcome = pending.await.expect("join").expect("dispatch");
    assert_eq!(outcome, Outcome::Committed);
    for rx in [&mut sender_rx, &mut other_rx] {
        assert_eq!(expect_tree(rx).factories.len(), 1);
        assert!(next_event(rx).is_none());
    }
}
