//! Chaos Tests
//!
//! Links that drop mid-request, backends that refuse to come back, frames
//! that arrive out of order or twice, and sessions the server expires. Time
//! is paused throughout; backoff and liveness run on the virtual clock.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready};

use common::*;
use realtime_engine::{
    ClientEvent, Completion, ConnectionState, ConversationItem, Denial, EngineConfig,
    EngineError, EngineEvent, InProcessConnector, LivenessConfig, RealtimeClient, Request,
    ResponseParams, Role, SessionState,
};

fn no_jitter() -> EngineConfig {
    let mut config = EngineConfig::for_testing();
    config.backoff.jitter = 0.0;
    config
}

// =============================================================================
// Connection loss
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_pending_and_reconnects() {
    let mut h = ready_client(no_jitter()).await;

    let pending = h
        .client
        .submit(Request::ItemCreate(ConversationItem::user_text("lost")))
        .unwrap();
    next_request(&mut h.peer).await;
    drop(h.peer);

    assert_eq!(pending.await, Err(EngineError::SessionLost));
    assert_eq!(h.client.session_state(), SessionState::NotInitialized);
    assert_eq!(h.client.pending_count(), 0);

    let mut peer = h.server.accept().await.expect("reconnect");
    let event = wait_for(&mut h.events, |e| matches!(e, EngineEvent::Reconnected { .. })).await;
    assert_eq!(event, EngineEvent::Reconnected { attempt: 1 });
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);

    // The old session is gone; messages wait for a new handshake
    let err = h
        .client
        .submit(Request::ItemCreate(ConversationItem::user_text("too soon")))
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::Denied(Denial::SessionNotReady {
            state: "NotInitialized"
        })
    );

    let handle = h
        .client
        .initialize_session(h.client.default_session())
        .unwrap();
    complete_handshake(&mut peer).await;
    assert!(handle.await.is_ok());
    assert_eq!(h.client.session_state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_loss_during_handshake_resolves_session_lost() {
    let (connector, mut server) = InProcessConnector::new_pair();
    let client = RealtimeClient::new(no_jitter(), connector);
    client.connect().await.unwrap();
    let mut peer = server.accept().await.unwrap();

    let handle = client.initialize_session(client.default_session()).unwrap();
    next_request(&mut peer).await;
    peer.close("server restart").await;

    assert_eq!(handle.await, Err(EngineError::SessionLost));
    assert_eq!(client.session_state(), SessionState::NotInitialized);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_retries() {
    let mut h = ready_client(no_jitter()).await;
    drain(&mut h.events);
    h.server.set_refuse_all(true);

    let started = Instant::now();
    drop(h.peer);

    let event = wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::ConnectionExhausted { .. })
    })
    .await;
    assert_eq!(event, EngineEvent::ConnectionExhausted { attempts: 3 });
    // 1 + 2 + 4 units of backoff
    assert_eq!(started.elapsed(), Duration::from_secs(7));
    assert_eq!(h.client.connection_state(), ConnectionState::Error);
    assert_eq!(h.server.connect_attempts(), 4);

    let err = h
        .client
        .submit(Request::ResponseCreate(ResponseParams::text()))
        .unwrap_err();
    assert_eq!(err, EngineError::ConnectionExhausted { attempts: 3 });

    // A manual connect starts over
    h.server.set_refuse_all(false);
    h.client.connect().await.unwrap();
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_double() {
    let mut h = ready_client(no_jitter()).await;
    drain(&mut h.events);
    h.server.set_refuse_all(true);
    drop(h.peer);

    let mut delays = Vec::new();
    loop {
        let event = wait_for(&mut h.events, |e| {
            matches!(
                e,
                EngineEvent::ReconnectScheduled { .. } | EngineEvent::ConnectionExhausted { .. }
            )
        })
        .await;
        match event {
            EngineEvent::ReconnectScheduled { attempt, delay } => delays.push((attempt, delay)),
            _ => break,
        }
    }

    assert_eq!(
        delays,
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_during_backoff_skips_the_wait() {
    let mut config = no_jitter();
    config.backoff.initial_units = 10;
    let mut h = ready_client(config).await;
    drop(h.peer);

    let event = wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(10),
        }
    );
    assert_eq!(
        h.client.connection_state(),
        ConnectionState::Backoff { attempt: 1 }
    );

    let started = Instant::now();
    h.client.connect().await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
    assert!(h.server.accept().await.is_some());

    // The cancelled retry never fires
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.server.connect_attempts(), 2);
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_stops_reconnecting() {
    let mut h = ready_client(no_jitter()).await;
    drop(h.peer);

    wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::ReconnectScheduled { .. })
    })
    .await;
    h.client.disconnect();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.server.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_link_is_declared_dead() {
    let mut config = EngineConfig::for_testing();
    config.liveness = LivenessConfig::for_testing();
    config.connection.auto_reconnect = false;
    let h = ready_client(config).await;

    // The peer stops reading, so no pong ever comes back
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.client.connection_state(), ConnectionState::Error);
    assert_eq!(h.client.session_state(), SessionState::NotInitialized);
    assert!(h.peer.is_closed_by_client());
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_show_in_link_health() {
    let mut config = EngineConfig::for_testing();
    config.liveness = LivenessConfig::for_testing();
    let Harness {
        client,
        server: _server,
        mut peer,
        events: _events,
    } = ready_client(config).await;

    // A backend that keeps reading answers every ping
    let backend = tokio::spawn(async move { while peer.recv_text().await.is_some() {} });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    let health = client.link_health().expect("link is up");
    assert!(health.pings_sent >= 2, "{health:?}");
    assert!(health.pongs_received >= 1, "{health:?}");
    assert_eq!(health.missed_pongs, 0);
    assert!(health.last_rtt.is_some());
    assert_eq!(client.stats().link.map(|l| l.pings_sent >= 2), Some(true));

    client.disconnect();
    assert_eq!(client.link_health(), None);
    backend.abort();
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_rebuilds_connection() {
    let mut h = ready_client(no_jitter()).await;

    let pending = h
        .client
        .submit(Request::ResponseCreate(ResponseParams::text()))
        .unwrap();
    next_request(&mut h.peer).await;

    h.peer
        .send_json(json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "code": "session_expired",
                "message": "Your session hit the maximum duration of 30 minutes."
            }
        }))
        .await;

    wait_for(&mut h.events, |e| matches!(e, EngineEvent::SessionExpired)).await;
    assert_eq!(pending.await, Err(EngineError::SessionLost));

    let _peer = h.server.accept().await.expect("reconnect");
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::Reconnected { .. })).await;
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
    assert_eq!(h.client.session_state(), SessionState::NotInitialized);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_server_error_is_reported() {
    let mut h = ready_client(EngineConfig::for_testing()).await;
    drain(&mut h.events);

    h.peer
        .send_json(json!({
            "type": "error",
            "error": { "type": "server_error", "message": "Internal hiccup" }
        }))
        .await;

    let event = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ServerError { .. })).await;
    assert_eq!(
        event,
        EngineEvent::ServerError {
            code: None,
            message: "Internal hiccup".to_string(),
        }
    );
    assert_eq!(h.client.session_state(), SessionState::Ready);
}

// =============================================================================
// Frame ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_interleaved_streams_stay_separate() {
    let mut config = EngineConfig::for_testing();
    config.correlator.max_concurrent_responses = 4;
    let mut h = ready_client(config).await;
    drain(&mut h.events);

    let first = h
        .client
        .submit(Request::ResponseCreate(ResponseParams::text()))
        .unwrap();
    let first_id = next_request(&mut h.peer).await.event_id().clone();
    let second = h
        .client
        .submit(Request::ResponseCreate(ResponseParams::text()))
        .unwrap();
    let second_id = next_request(&mut h.peer).await.event_id().clone();

    h.peer.send_json(response_created(&first_id, "resp_a")).await;
    h.peer.send_json(response_created(&second_id, "resp_b")).await;
    h.peer.send_json(delta("resp_a", "1")).await;
    h.peer.send_json(delta("resp_b", "x")).await;
    h.peer.send_json(delta("resp_a", "2")).await;
    h.peer.send_json(delta("resp_b", "y")).await;
    h.peer.send_json(response_done("resp_b", "completed")).await;
    h.peer.send_json(response_done("resp_a", "completed")).await;

    // Terminal frames repeated for streams already closed
    h.peer.send_json(response_done("resp_a", "completed")).await;
    h.peer.send_json(response_done("resp_b", "completed")).await;

    let a = first.await.unwrap().into_response().unwrap();
    let b = second.await.unwrap().into_response().unwrap();
    assert_eq!(a.text, "12");
    assert_eq!(b.text, "xy");
    assert_eq!(a.correlation_id, first_id);
    assert_eq!(b.correlation_id, second_id);

    settle().await;
    assert_eq!(anomalies(&drain(&mut h.events)), 2);
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_acknowledgements_out_of_order() {
    let mut h = ready_client(EngineConfig::for_testing()).await;

    let mut handles = Vec::new();
    let mut ids = Vec::new();
    for text in ["one", "two", "three"] {
        handles.push(
            h.client
                .submit(Request::ItemCreate(ConversationItem::user_text(text)))
                .unwrap(),
        );
        ids.push(next_request(&mut h.peer).await.event_id().clone());
    }

    for (n, id) in ids.iter().enumerate().rev() {
        h.peer.send_json(item_created(id, &format!("item_{n}"))).await;
    }

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(
            handle.await,
            Ok(Completion::Item {
                item_id: format!("item_{n}")
            })
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_an_anomaly() {
    let mut h = ready_client(EngineConfig::for_testing()).await;
    drain(&mut h.events);

    let handle = h
        .client
        .submit(Request::ItemCreate(ConversationItem::user_text("slow")))
        .unwrap();
    let id = next_request(&mut h.peer).await.event_id().clone();
    assert!(matches!(handle.await, Err(EngineError::Timeout { .. })));

    h.peer.send_json(item_created(&id, "item_late")).await;
    settle().await;
    assert_eq!(anomalies(&drain(&mut h.events)), 1);
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handle_is_pending_until_acknowledged() {
    let mut h = ready_client(EngineConfig::for_testing()).await;

    let handle = h
        .client
        .submit(Request::ItemCreate(ConversationItem::user_text("wait")))
        .unwrap();
    let id = next_request(&mut h.peer).await.event_id().clone();

    let mut task = tokio_test::task::spawn(handle);
    assert_pending!(task.poll());

    h.peer.send_json(item_created(&id, "item_9")).await;
    settle().await;

    assert!(task.is_woken());
    let result = assert_ready!(task.poll());
    assert_eq!(
        result,
        Ok(Completion::Item {
            item_id: "item_9".to_string()
        })
    );
}

// =============================================================================
// History replay
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_history_replayed_into_new_session() {
    let mut h = ready_client(no_jitter()).await;

    {
        let client = &h.client;
        let peer = &mut h.peer;
        let backend = async move {
            let id = next_request(peer).await.event_id().clone();
            peer.send_json(item_created(&id, "item_1")).await;
            let id = next_request(peer).await.event_id().clone();
            peer.send_json(response_created(&id, "resp_1")).await;
            peer.send_json(delta("resp_1", "Hello!")).await;
            peer.send_json(response_done("resp_1", "completed")).await;
        };
        let (reply, ()) = tokio::join!(client.send_message("Hi"), backend);
        assert_eq!(reply.unwrap().text, "Hello!");
    }

    drop(h.peer);
    let mut peer = h.server.accept().await.expect("reconnect");
    wait_for(&mut h.events, |e| matches!(e, EngineEvent::Reconnected { .. })).await;

    let handle = h
        .client
        .initialize_session(h.client.default_session())
        .unwrap();
    complete_handshake(&mut peer).await;
    assert!(handle.await.is_ok());

    let user = next_request(&mut peer).await;
    let assistant = next_request(&mut peer).await;
    let (ClientEvent::ItemCreate { item: user, .. }, ClientEvent::ItemCreate { item: assistant, .. }) =
        (user, assistant)
    else {
        panic!("expected two replayed items");
    };
    assert_eq!((user.role, user.text()), (Role::User, "Hi".to_string()));
    assert_eq!(
        (assistant.role, assistant.text()),
        (Role::Assistant, "Hello!".to_string())
    );
    assert_eq!(h.client.pending_count(), 2);
    assert_eq!(h.client.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_session_forgets_history() {
    let mut h = ready_client(EngineConfig::for_testing()).await;

    {
        let client = &h.client;
        let peer = &mut h.peer;
        let backend = async move {
            let id = next_request(peer).await.event_id().clone();
            peer.send_json(item_created(&id, "item_1")).await;
            let id = next_request(peer).await.event_id().clone();
            peer.send_json(response_created(&id, "resp_1")).await;
            peer.send_json(response_done("resp_1", "completed")).await;
        };
        let (reply, ()) = tokio::join!(client.send_message("Hi"), backend);
        assert!(reply.is_ok());
    }
    assert_eq!(h.client.history().len(), 1);

    h.client.start_session().unwrap();
    h.client.end_session().unwrap();
    assert!(h.client.history().is_empty());
}

// =============================================================================
// Randomized schedules
// =============================================================================

const STREAMS: usize = 3;
const ITEMS: usize = 2;
const DELTAS: [&str; 3] = ["a", "b", "c"];

/// One backend frame, named by the request it answers
#[derive(Clone, Copy, Debug)]
enum Reply {
    ItemAck(usize),
    Created(usize),
    Delta(usize, usize),
    Done(usize),
}

/// Expected outcome of one response stream given the order frames arrive in
#[derive(Clone, Debug, Default)]
struct StreamModel {
    created: bool,
    done: bool,
    text: String,
}

fn resp_id(stream: usize) -> String {
    format!("resp_{stream}")
}

#[tokio::test(start_paused = true)]
async fn test_shuffled_frames_resolve_every_request_once() {
    for seed in 0..32 {
        shuffled_round(seed).await;
    }
}

async fn shuffled_round(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut config = EngineConfig::for_testing();
    config.correlator.max_concurrent_responses = STREAMS;
    let mut h = ready_client(config).await;
    drain(&mut h.events);

    let mut streams = Vec::new();
    for _ in 0..STREAMS {
        let handle = h
            .client
            .submit(Request::ResponseCreate(ResponseParams::text()))
            .unwrap();
        let id = next_request(&mut h.peer).await.event_id().clone();
        streams.push((id, handle));
    }
    let mut items = Vec::new();
    for i in 0..ITEMS {
        let handle = h
            .client
            .submit(Request::ItemCreate(ConversationItem::user_text(format!("item {i}"))))
            .unwrap();
        let id = next_request(&mut h.peer).await.event_id().clone();
        items.push((id, handle));
    }

    // Every terminal frame is sent twice
    let mut replies = Vec::new();
    for s in 0..STREAMS {
        replies.push(Reply::Created(s));
        replies.extend((0..DELTAS.len()).map(|k| Reply::Delta(s, k)));
        replies.extend([Reply::Done(s), Reply::Done(s)]);
    }
    for i in 0..ITEMS {
        replies.extend([Reply::ItemAck(i), Reply::ItemAck(i)]);
    }
    replies.shuffle(&mut rng);

    let mut model = vec![StreamModel::default(); STREAMS];
    let mut acked = [false; ITEMS];
    let mut ignored = 0;
    for reply in &replies {
        let frame = match *reply {
            Reply::ItemAck(i) => {
                ignored += usize::from(acked[i]);
                acked[i] = true;
                item_created(&items[i].0, &format!("item_{i}"))
            }
            Reply::Created(s) => {
                model[s].created = true;
                response_created(&streams[s].0, &resp_id(s))
            }
            Reply::Delta(s, k) => {
                if model[s].created && !model[s].done {
                    model[s].text.push_str(DELTAS[k]);
                } else {
                    ignored += 1;
                }
                delta(&resp_id(s), DELTAS[k])
            }
            Reply::Done(s) => {
                if model[s].created && !model[s].done {
                    model[s].done = true;
                } else {
                    ignored += 1;
                }
                response_done(&resp_id(s), "completed")
            }
        };
        assert!(h.peer.send_json(frame).await);
    }

    for (s, (_, handle)) in streams.into_iter().enumerate() {
        let outcome = tokio::time::timeout(Duration::from_secs(600), handle)
            .await
            .expect("stream never resolved");
        if model[s].done {
            let response = outcome.unwrap().into_response().unwrap();
            assert_eq!(response.text, model[s].text, "seed {seed}, stream {s}: {replies:?}");
        } else {
            assert!(
                matches!(outcome, Err(EngineError::Timeout { .. })),
                "seed {seed}, stream {s}: {outcome:?}"
            );
        }
    }
    for (i, (_, handle)) in items.into_iter().enumerate() {
        assert_eq!(
            handle.await,
            Ok(Completion::Item {
                item_id: format!("item_{i}")
            }),
            "seed {seed}"
        );
    }

    // Frames queued behind the last resolution are still being routed
    settle().await;
    assert_eq!(h.client.pending_count(), 0, "seed {seed}");
    assert_eq!(anomalies(&drain(&mut h.events)), ignored, "seed {seed}: {replies:?}");
}

fn assert_no_session_without_link(client: &RealtimeClient, step: &str) {
    let connection = client.connection_state();
    if !connection.is_connected() {
        assert_eq!(
            client.session_state(),
            SessionState::NotInitialized,
            "{connection} after {step}"
        );
        assert_eq!(client.pending_count(), 0, "{connection} after {step}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_random_link_schedule_never_leaves_session_without_connection() {
    for seed in 0..16 {
        link_schedule(seed).await;
    }
}

async fn link_schedule(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (connector, mut server) = InProcessConnector::new_pair();
    let client = RealtimeClient::new(EngineConfig::for_testing(), connector);
    let mut peer = None;
    let mut handles = Vec::new();

    for _ in 0..40 {
        let step = match rng.gen_range(0..7) {
            0 => {
                let _ = client.connect().await;
                "connect"
            }
            1 => {
                client.disconnect();
                "disconnect"
            }
            2 => {
                drop(peer.take());
                "link drop"
            }
            3 => {
                server.refuse_next(rng.gen_range(1..=2));
                "refuse"
            }
            4 => {
                if client.connection_state().is_connected()
                    && client.session_state() == SessionState::NotInitialized
                {
                    if let (Some(p), Ok(handle)) = (
                        peer.as_mut(),
                        client.initialize_session(client.default_session()),
                    ) {
                        complete_handshake(p).await;
                        assert!(handle.await.is_ok(), "seed {seed}");
                    }
                }
                "handshake"
            }
            5 => {
                if let Ok(handle) =
                    client.submit(Request::ItemCreate(ConversationItem::user_text("hello")))
                {
                    handles.push(handle);
                }
                "submit"
            }
            _ => {
                tokio::time::sleep(Duration::from_secs(rng.gen_range(0..=4))).await;
                "advance"
            }
        };
        settle().await;
        while let Some(p) = server.try_accept() {
            peer = Some(p);
        }
        assert_no_session_without_link(&client, step);
    }

    client.disconnect();
    assert_no_session_without_link(&client, "final disconnect");
    for handle in handles {
        assert!(handle.await.is_err(), "seed {seed}");
    }
}
