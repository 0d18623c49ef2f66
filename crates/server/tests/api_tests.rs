use chunkdb_core::config::Settings;
use chunkdb_core::embed::HashingEmbedder;
use chunkdb_core::pipeline::Orchestrator;
use chunkdb_server::api::create_router;
use chunkdb_server::api::handlers::AppState;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

const DIM: usize = 128;

struct TestApp {
    base_url: String,
    _input: TempDir,
    _data: TempDir,
}

/// Ingest a small corpus, then serve it on an ephemeral port.
async fn spawn_app() -> TestApp {
    let input = TempDir::new().expect("Failed to create temp dir");
    let data = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(
        input.path().join("geology.txt"),
        "Volcanoes form where magma reaches the surface. Glaciers carve deep valleys over centuries.",
    )
    .unwrap();
    std::fs::write(
        input.path().join("paged.txt"),
        "Tides rise and fall 2 times a day.\x0cCoral reefs grow in warm shallow water.",
    )
    .unwrap();
    std::fs::write(input.path().join("broken.txt"), [0xc3u8, 0x28, 0xff]).unwrap();

    let settings = Settings {
        embedding_dimension: DIM,
        chunk_window: 1,
        chunk_overlap: 0,
        worker_threads: 2,
        ..Settings::default()
    };
    let pipeline = Orchestrator::open(
        data.path(),
        settings,
        Arc::new(HashingEmbedder::new(DIM).unwrap()),
    )
    .expect("Failed to open pipeline");
    pipeline.discover(input.path()).unwrap();
    pipeline.run().unwrap();

    let prometheus_handle =
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(_) => metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle(),
        };

    let state = AppState::new(Arc::new(pipeline), prometheus_handle);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{}", addr),
        _input: input,
        _data: data,
    }
}

fn client() -> Client {
    Client::new()
}

async fn query(app: &TestApp, body: Value) -> reqwest::Response {
    client()
        .post(format!("{}/query", app.base_url))
        .json(&body)
        .send()
        .await
        .expect("Failed to send query")
}

async fn documents(app: &TestApp) -> Vec<Value> {
    client()
        .get(format!("{}/documents", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn document_id(app: &TestApp, file: &str) -> String {
    documents(app)
        .await
        .into_iter()
        .find(|d| d["origin"].as_str().unwrap().ends_with(file))
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health_reports_documents_and_failures() {
    let app = spawn_app().await;
    let resp = client()
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["documents"], 3);
    assert_eq!(body["failed_documents"], 1);
    assert_eq!(body["indexed_chunks"], 4);
    assert_eq!(body["warnings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_query_returns_ranked_results_with_provenance() {
    let app = spawn_app().await;
    let resp = query(&app, json!({ "text": "glaciers carve valleys", "k": 3 })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(body["count"], results.len());
    assert_eq!(results.len(), 3);

    let top = &results[0];
    assert!(top["snippet"].as_str().unwrap().starts_with("Glaciers"));
    assert!(top["provenance"]["source"].as_str().unwrap().ends_with("geology.txt"));
    assert_eq!(top["provenance"]["tags"]["element"], "text");
    assert_eq!(top["provenance"]["cite"], "p1 s2-2");

    let scores: Vec<f64> = results.iter().map(|r| r["score"].as_f64().unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn test_query_k_defaults_when_omitted() {
    let app = spawn_app().await;
    let resp = query(&app, json!({ "text": "water" })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    // five requested, four chunks exist
    assert_eq!(body["count"], 4);
}

#[tokio::test]
async fn test_query_rejects_invalid_k() {
    let app = spawn_app().await;
    for k in [0, -3, 100_000] {
        let resp = query(&app, json!({ "text": "tides", "k": k })).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("k must be"));
    }
}

#[tokio::test]
async fn test_query_filters_by_document_and_tag() {
    let app = spawn_app().await;
    let paged = document_id(&app, "paged.txt").await;

    let resp = query(
        &app,
        json!({ "text": "volcanoes and magma", "k": 5, "document_ids": [paged] }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r["provenance"]["document_id"] == paged.as_str()));

    let resp = query(
        &app,
        json!({
            "text": "reefs",
            "k": 5,
            "tags": { "must": [{ "field": "page_start", "op": "eq", "value": 2 }] }
        }),
    )
    .await;
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["snippet"].as_str().unwrap().starts_with("Coral"));

    let resp = query(
        &app,
        json!({ "text": "reefs", "k": 5, "tags": { "must": [{ "field": "page_start", "op": "in" }] } }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_query_filters_by_entity_label() {
    let app = spawn_app().await;

    let resp = query(&app, json!({ "text": "tides and reefs", "k": 5, "entities": ["cardinal"] })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["snippet"].as_str().unwrap().starts_with("Tides"));
    assert_eq!(results[0]["entities"][0]["label"], "CARDINAL");
    assert_eq!(results[0]["entities"][0]["text"], "2");

    let resp = query(&app, json!({ "text": "tides", "k": 5, "entities": ["PERSON"] })).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["count"], 0);

    let resp = query(&app, json!({ "text": "tides", "k": 5, "entities": ["WIDGET"] })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_chunk() {
    let app = spawn_app().await;
    let body: Value = query(&app, json!({ "text": "tides", "k": 1 }))
        .await
        .json()
        .await
        .unwrap();
    let id = body["results"][0]["chunk_id"].as_str().unwrap().to_string();

    let resp = client()
        .get(format!("{}/chunks/{}", app.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let chunk: Value = resp.json().await.unwrap();
    assert_eq!(chunk["id"], id.as_str());
    assert_eq!(chunk["embedded"], true);
    assert_eq!(chunk["indexed"], true);
    assert_eq!(chunk["content_hash"].as_str().unwrap().len(), 64);

    let resp = client()
        .get(format!("{}/chunks/{}", app.base_url, uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client()
        .get(format!("{}/chunks/not-a-uuid", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_document_is_listed_and_retry_keeps_it_failed() {
    let app = spawn_app().await;
    let docs = documents(&app).await;
    assert_eq!(docs.len(), 3);
    let broken = docs
        .iter()
        .find(|d| d["origin"].as_str().unwrap().ends_with("broken.txt"))
        .unwrap();
    assert!(broken["state"].as_str().unwrap().starts_with("failed(extract)"));
    assert!(broken["failure"].as_str().is_some());
    assert_eq!(broken["chunks"], 0);

    let resp = client()
        .post(format!("{}/documents/{}/retry", app.base_url, broken["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["state"].as_str().unwrap().starts_with("failed(extract)"));

    let resp = client()
        .post(format!("{}/documents/{}/retry", app.base_url, uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_document_removes_its_results() {
    let app = spawn_app().await;
    let geology = document_id(&app, "geology.txt").await;

    let resp = client()
        .delete(format!("{}/documents/{}", app.base_url, geology))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed_chunks"].as_array().unwrap().len(), 2);

    let body: Value = query(&app, json!({ "text": "glaciers carve valleys", "k": 10 }))
        .await
        .json()
        .await
        .unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r["provenance"]["document_id"] != geology.as_str()));

    let resp = client()
        .delete(format!("{}/documents/{}", app.base_url, geology))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_and_metrics() {
    let app = spawn_app().await;
    let stats: Value = client()
        .get(format!("{}/stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["chunks"], 4);
    assert_eq!(stats["embedded_chunks"], 4);
    assert_eq!(stats["index"]["live_entries"], 4);
    assert_eq!(stats["index"]["dimension"], DIM);

    let resp = client()
        .get(format!("{}/metrics", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
