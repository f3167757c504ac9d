//! Spec §8 seed test 4: a concurrent SSE subscriber observes strictly
//! non-decreasing `chunks_processed` progress events, then one `completed`
//! event, then the stream closes.

mod common;

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use kg_core::{JobSource, JobSpec, JobType, ProcessingMode};
use tower::ServiceExt;

/// Split a raw SSE body into `(event, data)` pairs.
fn parse_sse(body: &str) -> Vec<(String, String)> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = String::new();
            let mut data = String::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = rest.to_string();
                }
            }
            (event, data)
        })
        .collect()
}

#[tokio::test]
async fn progress_events_are_monotonic_then_completed_then_stream_closes() {
    let harness = common::build();

    let document_text = "concept ".repeat(12); // 96 chars / 32-char chunks = 3 chunks
    let spec = JobSpec {
        job_type: JobType::Ingestion,
        job_data: serde_json::to_value(kg_ingest::IngestionJobData {
            document_text: document_text.clone(),
            filename: None,
            source_type: "text".to_string(),
            file_path: None,
            hostname: None,
            force: false,
        })
        .unwrap(),
        content_hash: Some(kg_core::content_hash(document_text.as_bytes())),
        ontology: "T1".to_string(),
        user_id: common::ALICE.user_id,
        is_system_job: false,
        source: JobSource::UserApi,
        source_metadata: BTreeMap::new(),
        processing_mode: ProcessingMode::Parallel,
        force: false,
    };
    let job = match harness.state.queue.enqueue(spec, None).unwrap() {
        kg_queue::EnqueueOutcome::Created(job) => job,
        kg_queue::EnqueueOutcome::AlreadyCompleted(_) => panic!("expected a fresh job"),
    };

    let stream_request = Request::builder()
        .uri(format!("/jobs/{}/stream", job.job_id))
        .header("authorization", format!("Bearer {}", common::ALICE.token()))
        .body(Body::empty())
        .unwrap();
    // The handler subscribes to the broker before returning the streaming
    // response, so awaiting this first guarantees the subscription exists
    // before the pipeline below starts publishing.
    let response = harness.app.clone().oneshot(stream_request).await.unwrap();

    let state = harness.state.clone();
    let driver = tokio::spawn(async move {
        common::drain_dispatch(&state).await;
    });

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    driver.await.unwrap();

    let body = String::from_utf8(body_bytes.to_vec()).unwrap();
    let events = parse_sse(&body);
    assert!(!events.is_empty(), "expected at least one SSE event");

    let mut last_percent: Option<u64> = None;
    let mut saw_completed = false;
    for (name, data) in &events {
        match name.as_str() {
            "progress" => {
                assert!(!saw_completed, "no progress event may follow completion");
                let snapshot: serde_json::Value = serde_json::from_str(data).unwrap();
                let percent = snapshot["percent"].as_u64().unwrap();
                if let Some(prev) = last_percent {
                    assert!(percent >= prev, "percent must be non-decreasing within a stage");
                }
                last_percent = Some(percent);
            }
            "completed" => {
                saw_completed = true;
            }
            "keepalive" | "failed" | "error" => {}
            other => panic!("unexpected SSE event name: {other}"),
        }
    }
    assert!(saw_completed, "stream must end with a completed event for a successful job");

    let final_job = harness.state.queue.get(&job.job_id).unwrap();
    assert_eq!(final_job.status, kg_core::JobStatus::Completed);
    assert_eq!(final_job.progress.as_ref().unwrap().chunks_processed, 3);
}
