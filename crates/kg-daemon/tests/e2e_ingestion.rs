//! End-to-end HTTP ingestion scenarios (spec §8 seed tests 1-3): happy
//! ingest, duplicate detection, and forced re-ingestion idempotence.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

fn ingest_request(body: &str, content_type: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", content_type)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Builds a `multipart/form-data` body carrying `document`, `ontology`,
/// and `force` fields, matching what `handlers::jobs::ingest` reads.
fn multipart_body(boundary: &str, document: &str, ontology: &str, force: bool) -> String {
    format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"document\"; filename=\"doc.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {document}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"ontology\"\r\n\r\n\
         {ontology}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"force\"\r\n\r\n\
         {force}\r\n\
         --{boundary}--\r\n"
    )
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_ingest_completes_and_creates_document_meta() {
    let harness = common::build();
    let boundary = "X-BOUNDARY-1";
    let body = multipart_body(boundary, "Alpha. Beta. Gamma.", "T1", false);
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let response = harness
        .app
        .clone()
        .oneshot(ingest_request(&body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let enqueued = json_body(response).await;
    let job_id = enqueued["job_id"].as_str().unwrap().to_string();
    assert!(matches!(enqueued["status"].as_str().unwrap(), "queued" | "approved" | "awaiting_approval"));

    let run = common::drain_dispatch(&harness.state).await;
    assert_eq!(run, vec![job_id.clone()]);

    let request = Request::builder()
        .uri(format!("/jobs/{job_id}"))
        .header("authorization", format!("Bearer {}", common::ALICE.token()))
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"]["chunks_processed"], job["progress"]["chunks_total"]);
    assert!(job["progress"]["chunks_processed"].as_u64().unwrap() >= 1);

    let doc_meta = harness
        .state
        .graph
        .get_document_meta(&kg_core::content_hash(b"Alpha. Beta. Gamma."), "T1")
        .await
        .unwrap();
    assert!(doc_meta.is_some(), "DocumentMeta must exist for the ingested content hash + ontology");
}

#[tokio::test]
async fn duplicate_submission_returns_existing_job_without_enqueueing_again() {
    let harness = common::build();
    let boundary = "X-BOUNDARY-2";
    let body = multipart_body(boundary, "Alpha. Beta. Gamma.", "T1", false);
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let first = harness
        .app
        .clone()
        .oneshot(ingest_request(&body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_job = json_body(first).await;
    let first_job_id = first_job["job_id"].as_str().unwrap().to_string();
    common::drain_dispatch(&harness.state).await;

    let second = harness
        .app
        .clone()
        .oneshot(ingest_request(&body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let duplicate = json_body(second).await;
    assert_eq!(duplicate["duplicate"], true);
    assert_eq!(duplicate["existing_job_id"], first_job_id);
    assert_eq!(duplicate["status"], "completed");

    let page = harness.state.queue.list(&kg_queue::JobFilter::default());
    assert_eq!(page.jobs.len(), 1, "a duplicate submission must not create a second job row");
}

#[tokio::test]
async fn forced_reingest_is_idempotent_on_graph_counts() {
    let harness = common::build();
    let boundary = "X-BOUNDARY-3";
    let body = multipart_body(boundary, "Alpha. Beta. Gamma.", "T1", false);
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let first = harness
        .app
        .clone()
        .oneshot(ingest_request(&body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    common::drain_dispatch(&harness.state).await;
    let counts_after_first = harness.state.graph.object_counts().await.unwrap();

    let forced_body = multipart_body(boundary, "Alpha. Beta. Gamma.", "T1", true);
    let second = harness
        .app
        .clone()
        .oneshot(ingest_request(&forced_body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    let second_job = json_body(second).await;
    assert_ne!(second_job["job_id"].as_str().unwrap(), "", "forced re-ingest gets a fresh job id");
    common::drain_dispatch(&harness.state).await;

    let counts_after_second = harness.state.graph.object_counts().await.unwrap();
    assert_eq!(counts_after_first, counts_after_second, "re-ingesting identical content must not change graph counts");
}

#[tokio::test]
async fn empty_document_completes_with_no_chunks_and_no_mutation() {
    let harness = common::build();
    let boundary = "X-BOUNDARY-4";
    let body = multipart_body(boundary, "", "T1", false);
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let response = harness
        .app
        .clone()
        .oneshot(ingest_request(&body, &content_type, &common::ALICE.token()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let enqueued = json_body(response).await;
    let job_id = enqueued["job_id"].as_str().unwrap().to_string();
    common::drain_dispatch(&harness.state).await;

    let counts = harness.state.graph.object_counts().await.unwrap();
    assert_eq!(counts.concept_count, 0);

    let request = Request::builder()
        .uri(format!("/jobs/{job_id}"))
        .header("authorization", format!("Bearer {}", common::ALICE.token()))
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let job = json_body(response).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"]["chunks_total"], 0);
}
