use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use ride_dispatch::api::rest::router;
use ride_dispatch::engine::matching::MatchingEngine;
use ride_dispatch::engine::notification::NotificationDispatcher;
use ride_dispatch::broadcast::protocol::ServerMessage;
use ride_dispatch::engine::pipeline::DispatchPipeline;
use ride_dispatch::gateway::{DeliveryReceipt, PushError, PushGateway, PushMessage};
use ride_dispatch::models::driver::{Driver, DriverStatus, GeoPoint};
use ride_dispatch::models::matching::CandidateSummary;
use ride_dispatch::models::ride::{RideRequest, RideStatus};
use ride_dispatch::state::AppState;
use ride_dispatch::store::MemoryStore;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<PushMessage>>,
    dead_tokens: Vec<String>,
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn send(&self, message: &PushMessage) -> Result<DeliveryReceipt, PushError> {
        self.sent.lock().unwrap().push(message.clone());
        if self.dead_tokens.contains(&message.token) {
            return Err(PushError::InvalidToken("UNREGISTERED".to_string()));
        }
        Ok(DeliveryReceipt {
            message_id: format!("projects/test/messages/{}", message.token),
        })
    }
}

fn ride(id: i64, lat: f64, lng: f64) -> RideRequest {
    RideRequest {
        id,
        passenger_id: Some(1),
        vehicle_type: "car".to_string(),
        pickup: GeoPoint::new(lat, lng),
        pickup_address: "1 Le Loi".to_string(),
        dropoff: GeoPoint::new(lat + 0.01, lng + 0.01),
        dropoff_address: "9 Nguyen Hue".to_string(),
        status: RideStatus::Requested,
        estimated_fare: Some(55_000.0),
        distance_km: Some(2.1),
        created_at: Utc::now(),
    }
}

fn driver(id: i64, phone: &str, lat: f64, lng: f64) -> Driver {
    Driver {
        id,
        phone_number: phone.to_string(),
        push_token: Some(format!("token-{id}")),
        location: GeoPoint::new(lat, lng),
        vehicle_type: "car".to_string(),
        device_id: Some(id * 10),
        status: DriverStatus::Active,
        is_active: true,
        is_deleted: false,
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_ride(ride(42, 10.0, 106.0));
    store.upsert_driver(driver(7, "0901234567", 10.05, 106.05));
    store.upsert_driver(driver(9, "0907654321", 10.9, 107.9));
    store
}

fn pipeline(
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    push: Arc<RecordingPush>,
) -> DispatchPipeline {
    DispatchPipeline::new(
        state,
        MatchingEngine::new(store.clone(), 10.0),
        NotificationDispatcher::new(store, push, Duration::from_secs(300), "New ride request"),
    )
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let app = router(Arc::new(AppState::new(16, 8)));
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["candidates"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let app = router(Arc::new(AppState::new(16, 8)));
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("matches_created_total"));
    assert!(body.contains("connected_sessions"));
}

#[tokio::test]
async fn snapshot_initially_empty() {
    let app = router(Arc::new(AppState::new(16, 8)));
    let response = app.oneshot(get_request("/snapshot")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "requestedDrivers": [] }));
}

#[tokio::test]
async fn websocket_route_rejects_plain_get() {
    let app = router(Arc::new(AppState::new(16, 8)));
    let response = app.oneshot(get_request("/ws")).await.unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn dispatch_cycle_updates_snapshot_and_notifies_once() {
    let store = seeded_store();
    let push = Arc::new(RecordingPush::default());
    let state = Arc::new(AppState::new(16, 8));
    let app = router(state.clone());
    let mut events = state.events_tx.subscribe();
    let mut pipeline = pipeline(state.clone(), store.clone(), push.clone());

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.matching.created, 2);
    assert_eq!(report.dispatch.sent, 2);
    assert!(report.broadcast);

    let frame = events.try_recv().unwrap().to_json().unwrap();
    let frame: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(
        frame,
        json!({
            "event": "driver_status_updated",
            "data": { "requestedDrivers": ["0901234567", "0907654321"] }
        })
    );

    let response = app.clone().oneshot(get_request("/snapshot")).await.unwrap();
    assert_eq!(
        body_json(response).await,
        json!({ "requestedDrivers": ["0901234567", "0907654321"] })
    );

    let near = store.match_record(42, 7).unwrap();
    assert!(near.within_radius);
    assert!(near.notified);
    let far = store.match_record(42, 9).unwrap();
    assert!(!far.within_radius);

    let again = pipeline.run_cycle().await.unwrap();
    assert_eq!(again.matching.created, 0);
    assert_eq!(again.dispatch.sent, 0);
    assert!(!again.broadcast);
    assert_eq!(push.sent.lock().unwrap().len(), 2);

    let response = app.oneshot(get_request("/metrics")).await.unwrap();
    let body = body_string(response).await;
    assert!(body.contains("dispatch_cycles_total{outcome=\"success\"} 2"));
    assert!(body.contains("matches_created_total 2"));
    assert!(body.contains("notifications_total{outcome=\"sent\"} 2"));
    assert!(body.contains("broadcasts_total 1"));
}

#[tokio::test]
async fn accepted_ride_drops_other_candidates() {
    let store = seeded_store();
    let push = Arc::new(RecordingPush::default());
    let state = Arc::new(AppState::new(16, 8));
    let mut pipeline = pipeline(state.clone(), store.clone(), push);

    pipeline.run_cycle().await.unwrap();
    store.set_match_status(42, 7, RideStatus::Accepted);

    let report = pipeline.run_cycle().await.unwrap();
    assert!(report.broadcast);
    assert_eq!(
        state.current_summary().requested_drivers,
        vec!["0907654321".to_string()]
    );
}

#[tokio::test]
async fn dead_token_is_cleared() {
    let store = seeded_store();
    let push = Arc::new(RecordingPush {
        dead_tokens: vec!["token-9".to_string()],
        ..RecordingPush::default()
    });
    let state = Arc::new(AppState::new(16, 8));
    let mut pipeline = pipeline(state, store.clone(), push.clone());

    let report = pipeline.run_cycle().await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(report.dispatch.invalid_tokens, 1);
    assert!(store.driver(9).unwrap().push_token.is_none());
    assert!(!store.match_record(42, 9).unwrap().notified);

    let again = pipeline.run_cycle().await.unwrap();
    assert_eq!(again.dispatch.missing_token, 1);
    assert_eq!(push.sent.lock().unwrap().len(), 2);
}

type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(state: Arc<AppState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn next_json(socket: &mut ClientSocket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_client_gets_snapshot_updates_and_pong() {
    let state = Arc::new(AppState::new(16, 8));
    state.publish_summary(CandidateSummary {
        requested_drivers: vec!["0901234567".to_string()],
    });
    let url = serve(state.clone()).await;

    let (mut socket, _) = connect_async(url).await.unwrap();

    assert_eq!(
        next_json(&mut socket).await,
        json!({ "event": "requested_drivers", "phoneNumbers": ["0901234567"] })
    );
    // The snapshot is sent after the session subscribed to events.
    assert_eq!(state.sessions.len(), 1);

    let receivers = state.broadcast(ServerMessage::status_updated(CandidateSummary {
        requested_drivers: vec!["0901234567".to_string(), "0907654321".to_string()],
    }));
    assert_eq!(receivers, 1);
    assert_eq!(
        next_json(&mut socket).await,
        json!({
            "event": "driver_status_updated",
            "data": { "requestedDrivers": ["0901234567", "0907654321"] }
        })
    );

    socket
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let pong = next_json(&mut socket).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());

    socket.close(None).await.unwrap();
    for _ in 0..50 {
        if state.sessions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(state.sessions.is_empty());
    assert_eq!(state.metrics.connected_sessions.get(), 0);
}
