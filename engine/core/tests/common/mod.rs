//! Shared fixtures: an in-process backend scripted with JSON frames

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use realtime_engine::{
    ClientEvent, EngineConfig, EngineEvent, EventId, InProcessConnector, InProcessServer,
    PeerConnection, RealtimeClient, SessionState,
};

pub type Events = UnboundedReceiverStream<EngineEvent>;

/// A connected client with a ready session and the backend half of its link
pub struct Harness {
    pub client: RealtimeClient,
    pub server: InProcessServer,
    pub peer: PeerConnection,
    pub events: Events,
}

/// Let every runnable task finish without moving time meaningfully
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn session_frame(kind: &str, id: &EventId) -> Value {
    json!({
        "type": kind,
        "event_id": id.as_str(),
        "session": {
            "id": "sess_001",
            "model": "gpt-4o-realtime-preview",
            "expires_at": 1_700_000_000,
            "modalities": ["text"],
            "voice": "ash"
        }
    })
}

pub fn item_created(id: &EventId, item_id: &str) -> Value {
    json!({
        "type": "conversation.item.created",
        "event_id": id.as_str(),
        "item": { "id": item_id, "type": "message" }
    })
}

pub fn response_created(id: &EventId, response_id: &str) -> Value {
    json!({
        "type": "response.created",
        "event_id": id.as_str(),
        "response": { "id": response_id, "status": "in_progress" }
    })
}

pub fn delta(response_id: &str, text: &str) -> Value {
    json!({
        "type": "response.text.delta",
        "response_id": response_id,
        "delta": text
    })
}

pub fn response_done(response_id: &str, status: &str) -> Value {
    json!({
        "type": "response.done",
        "response": { "id": response_id, "status": status }
    })
}

/// Next text frame from the engine, which must be a request
pub async fn next_request(peer: &mut PeerConnection) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(600), peer.recv_event())
        .await
        .expect("engine sent nothing")
        .expect("link closed")
}

/// Answer the handshake the client just started
pub async fn complete_handshake(peer: &mut PeerConnection) -> EventId {
    let update = next_request(peer).await;
    assert_eq!(update.type_name(), "session.update");
    let id = update.event_id().clone();
    assert!(peer.send_json(session_frame("session.created", &id)).await);
    assert!(peer.send_json(session_frame("session.updated", &id)).await);
    id
}

/// Connect, accept, and run the handshake
pub async fn ready_client(config: EngineConfig) -> Harness {
    let (connector, mut server) = InProcessConnector::new_pair();
    let (client, events) = RealtimeClient::with_events(config, connector);

    client.connect().await.expect("connect");
    let mut peer = server.accept().await.expect("link");

    let handle = client
        .initialize_session(client.default_session())
        .expect("initialize");
    complete_handshake(&mut peer).await;
    handle.await.expect("handshake");
    assert_eq!(client.session_state(), SessionState::Ready);

    Harness {
        client,
        server,
        peer,
        events,
    }
}

/// Wait for the first event matching `pred`
pub async fn wait_for(events: &mut Events, pred: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.next().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

/// Everything emitted so far
pub fn drain(events: &mut Events) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.as_mut().try_recv() {
        seen.push(event);
    }
    seen
}

pub fn anomalies(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::ProtocolAnomaly { .. }))
        .count()
}
