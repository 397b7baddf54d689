//! Integration tests for the dashboard WebSocket + REST surface.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and exercises the real WS / REST contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use lead_pilot::channels::{Mailer, OutboundEmail, SentEmail};
use lead_pilot::config::PipelineConfig;
use lead_pilot::dashboard::dashboard_routes;
use lead_pilot::error::{ExternalError, LlmError};
use lead_pilot::leads::{Lead, LeadStatus, PlaceCandidate};
use lead_pilot::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use lead_pilot::pipeline::{OutreachChannel, Pipeline};
use lead_pilot::services::Services;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub LLM provider for integration tests (no real API calls).
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: "Neighbourhood barber shop, cash only, busy on Saturdays.".into(),
        })
    }
}

struct StubMailer;

#[async_trait]
impl Mailer for StubMailer {
    async fn send(&self, _email: &OutboundEmail) -> Result<SentEmail, ExternalError> {
        Ok(SentEmail {
            message_id: "<stub@test>".into(),
        })
    }
}

/// Start an Axum server on a random port, return (port, pipeline).
async fn start_server() -> (u16, Arc<Pipeline>) {
    let services = Services {
        llm: Some(Arc::new(StubLlm)),
        mailer: Some(Arc::new(StubMailer)),
        ..Default::default()
    };
    let pipeline = Pipeline::open(None, services, PipelineConfig::default())
        .await
        .unwrap();
    let app = dashboard_routes(Arc::clone(&pipeline));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, pipeline)
}

async fn seed_lead(pipeline: &Pipeline, place_id: &str) -> Lead {
    let (lead, _) = pipeline
        .leads()
        .create(
            PlaceCandidate {
                place_id: place_id.into(),
                name: format!("Barber {place_id}"),
                address: "5 Lamar Blvd".into(),
                phone: None,
                website: None,
                rating: Some(4.8),
                review_count: Some(64),
            },
            "Austin",
        )
        .await
        .unwrap();
    lead
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn next_json(ws: &mut Ws) -> Value {
    let msg = ws.next().await.unwrap().unwrap();
    parse_ws_json(&msg)
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_initial_state_first() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        let lead = seed_lead(&pipeline, "p1").await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("WS connect failed");

        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "initial_state");
        let leads = json["leads"].as_array().unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0]["id"], lead.id.to_string());
        assert_eq!(json["is_running"], false);
        assert!(json["pending_requests"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_events_arrive_in_stage_order() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        let lead = seed_lead(&pipeline, "p1").await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "initial_state");

        pipeline.research(lead.id).await.unwrap();
        pipeline
            .outreach(lead.id, OutreachChannel::Email, Some("owner@barber.com".into()))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let json = next_json(&mut ws).await;
            let label = match json["type"].as_str().unwrap() {
                "lead_updated" => format!("lead_updated:{}", json["status_after"].as_str().unwrap()),
                other => other.to_string(),
            };
            seen.push(label);
        }
        assert_eq!(
            seen,
            vec![
                "stage_started",
                "lead_updated:researched",
                "stage_started",
                "lead_updated:contacted",
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_reconnect_snapshot_matches_store() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        let first = seed_lead(&pipeline, "p1").await;

        let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        drop(ws);

        // Changes while disconnected.
        seed_lead(&pipeline, "p2").await;
        pipeline
            .leads()
            .update(first.id, |l| {
                l.transition_to(LeadStatus::Researched)
                    .expect("found -> researched");
                Ok(())
            })
            .await
            .unwrap();

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "initial_state");

        let snapshot: Vec<Lead> = serde_json::from_value(json["leads"].clone()).unwrap();
        let store = pipeline.leads().snapshot().await;
        assert_eq!(snapshot.len(), store.len());
        for lead in &store {
            let sent = snapshot.iter().find(|l| l.id == lead.id).unwrap();
            assert_eq!(sent.status, lead.status);
        }
        let refreshed = snapshot.iter().find(|l| l.id == first.id).unwrap();
        assert_eq!(refreshed.status, LeadStatus::Researched);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_reset_broadcast() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        seed_lead(&pipeline, "p1").await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "initial_state");

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{port}/reset"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "state_reset");
        assert!(pipeline.leads().is_empty().await);
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn rest_lists_and_filters_leads() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        let a = seed_lead(&pipeline, "p1").await;
        seed_lead(&pipeline, "p2").await;
        pipeline.research(a.id).await.unwrap();

        let client = reqwest::Client::new();
        let all: Vec<Value> = client
            .get(format!("http://127.0.0.1:{port}/api/leads"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let researched: Vec<Value> = client
            .get(format!("http://127.0.0.1:{port}/api/leads?status=researched"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(researched.len(), 1);
        assert_eq!(researched[0]["id"], a.id.to_string());

        let status: Value = client
            .get(format!("http://127.0.0.1:{port}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["lead_count"], 2);
        assert_eq!(status["is_running"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_activity_records_stage_events() {
    timeout(TEST_TIMEOUT, async {
        let (port, pipeline) = start_server().await;
        let lead = seed_lead(&pipeline, "p1").await;
        pipeline.research(lead.id).await.unwrap();

        let activity: Vec<Value> = reqwest::get(format!("http://127.0.0.1:{port}/api/activity"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let updated = activity
            .iter()
            .find(|e| e["event_type"] == "lead_updated")
            .expect("lead_updated in activity log");
        assert_eq!(updated["status_before"], "found");
        assert_eq!(updated["status_after"], "researched");
    })
    .await
    .expect("test timed out");
}
