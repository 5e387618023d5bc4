//! Envelope-service client tests against a throwaway axum server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use spo::core::types::{SampleId, Verdict};
use spo::io::capability::{Capabilities, CapabilityError, EvaluateRequest, OptimizeRequest};
use spo::io::service::ServiceClient;

type Captured = Arc<Mutex<Vec<Value>>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/api")
}

fn client(base_url: &str) -> ServiceClient {
    ServiceClient::new(base_url, Duration::from_secs(5)).expect("client")
}

/// Route answering every POST with `reply` and recording the request body.
fn recording_route(path: &str, status: StatusCode, reply: Value) -> (Router, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            path,
            post(
                move |State(captured): State<Captured>, Json(body): Json<Value>| {
                    let reply = reply.clone();
                    async move {
                        captured.lock().expect("captured lock").push(body);
                        (status, Json(reply))
                    }
                },
            ),
        )
        .with_state(Arc::clone(&captured));
    (app, captured)
}

#[tokio::test]
async fn list_models_reads_envelope_payload() {
    let app = Router::new().route(
        "/api/models",
        get(|| async { Json(json!({"success": true, "models": ["m1", "m2"]})) }),
    );
    let base = serve(app).await;

    let models = client(&base).list_models().await.expect("models");
    assert_eq!(models, vec!["m1".to_string(), "m2".to_string()]);
}

#[tokio::test]
async fn generate_samples_sends_camel_case_and_accepts_numeric_ids() {
    let (app, captured) = recording_route(
        "/api/generate-samples",
        StatusCode::OK,
        json!({"success": true, "samples": [{"id": 1, "question": "q1"}, {"id": "x", "question": "q2"}]}),
    );
    let base = serve(app).await;

    let samples = client(&base)
        .generate_samples("write haiku")
        .await
        .expect("samples");
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].id, SampleId::from(1));
    assert_eq!(samples[1].id, SampleId::from("x"));
    assert_eq!(
        captured.lock().expect("captured lock")[0],
        json!({"taskDescription": "write haiku"})
    );
}

#[tokio::test]
async fn optimize_reads_new_prompt_field() {
    let (app, captured) = recording_route(
        "/api/optimize-prompt",
        StatusCode::OK,
        json!({"success": true, "newPrompt": "improved"}),
    );
    let base = serve(app).await;

    let prompt = client(&base)
        .optimize_prompt(OptimizeRequest {
            current_prompt: "seed",
            current_output: "{}",
            task_description: "t",
            history: "",
        })
        .await
        .expect("optimize");
    assert_eq!(prompt, "improved");
    let body = &captured.lock().expect("captured lock")[0];
    assert_eq!(body["currentPrompt"], "seed");
    assert_eq!(body["taskDescription"], "t");
}

#[tokio::test]
async fn evaluation_label_maps_to_verdict() {
    let (app, captured) = recording_route(
        "/api/evaluate-outputs",
        StatusCode::OK,
        json!({"success": true, "evaluation": "B更好"}),
    );
    let base = serve(app).await;

    let verdict = client(&base)
        .evaluate_outputs(EvaluateRequest {
            output_a: "old",
            output_b: "new",
            task_description: "t",
            question: "q",
        })
        .await
        .expect("evaluate");
    assert_eq!(verdict, Verdict::CandidateBetter);
    let body = &captured.lock().expect("captured lock")[0];
    assert_eq!(body["outputA"], "old");
    assert_eq!(body["outputB"], "new");
}

#[tokio::test]
async fn failure_status_maps_to_remote_error_with_details() {
    let (app, _) = recording_route(
        "/api/execute-prompt",
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "Failed to execute prompt", "details": "quota exceeded"}),
    );
    let base = serve(app).await;

    let err = client(&base)
        .execute_prompt("p", "q")
        .await
        .expect_err("remote failure");
    match err {
        CapabilityError::Remote { message } => assert!(message.contains("quota exceeded")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn success_false_is_never_a_payload() {
    let (app, _) = recording_route(
        "/api/execute-prompt",
        StatusCode::OK,
        json!({"success": false, "output": "looks valid"}),
    );
    let base = serve(app).await;

    let err = client(&base)
        .execute_prompt("p", "q")
        .await
        .expect_err("flagged failure");
    assert!(matches!(err, CapabilityError::Remote { .. }));
}

#[tokio::test]
async fn missing_payload_field_is_malformed() {
    let (app, _) = recording_route("/api/analyze-changes", StatusCode::OK, json!({"success": true}));
    let base = serve(app).await;

    let err = client(&base)
        .analyze_changes(spo::io::capability::AnalyzeRequest {
            old_prompt: "a",
            new_prompt: "b",
            task_description: "t",
        })
        .await
        .expect_err("malformed");
    assert!(matches!(err, CapabilityError::MalformedResponse(_)));
}

#[tokio::test]
async fn unreachable_service_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let err = client(&format!("http://{addr}/api"))
        .list_models()
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, CapabilityError::Network(_)));
}
