//! Remote rerankers against a local stub server.
//!
//! The stub speaks both the Cohere `/v2/rerank` and the generic `/v1/rerank`
//! shapes; a closed port stands in for an unreachable service.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use ragweave_core::{LlmError, PipelineStage, RagError, ResolvedCredentials, RetryConfig};
use ragweave_rag::node::{Node, ScoredNode};
use ragweave_rag::rerank::{RerankConfig, RerankStrategy, Reranker, build_reranker};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Default)]
struct Stub {
    calls: Arc<AtomicUsize>,
    /// Leading requests answered with a 503.
    fail_first: usize,
}

/// Score = number of query words found in the document.
fn overlap_scores(body: &Value) -> Vec<(usize, f64)> {
    let query = body["query"].as_str().unwrap_or_default().to_lowercase();
    let words: Vec<&str> = query.split_whitespace().collect();
    body["documents"]
        .as_array()
        .map(|docs| {
            docs.iter()
                .enumerate()
                .map(|(i, d)| {
                    let text = d.as_str().unwrap_or_default().to_lowercase();
                    (i, words.iter().filter(|w| text.contains(*w)).count() as f64)
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn cohere(
    State(stub): State<Stub>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-key");
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "invalid api token"})),
        );
    }
    let mut scores = overlap_scores(&body);
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));
    let top_n = body["top_n"].as_u64().unwrap_or(scores.len() as u64) as usize;
    scores.truncate(top_n);
    let results: Vec<Value> = scores
        .into_iter()
        .map(|(index, score)| json!({"index": index, "relevance_score": score / 10.0}))
        .collect();
    (StatusCode::OK, Json(json!({ "results": results })))
}

async fn cross_encoder(State(stub): State<Stub>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let call = stub.calls.fetch_add(1, Ordering::SeqCst);
    if call < stub.fail_first {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "model loading"})),
        );
    }
    // Raw logits: centred so a zero-overlap document scores below 0.5 after the sigmoid.
    let results: Vec<Value> = overlap_scores(&body)
        .into_iter()
        .map(|(index, score)| json!({"index": index, "relevance_score": score - 1.0}))
        .collect();
    (StatusCode::OK, Json(json!({ "results": results })))
}

async fn serve(stub: Stub) -> String {
    let app = Router::new()
        .route("/v2/rerank", post(cohere))
        .route("/v1/rerank", post(cross_encoder))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A URL nothing listens on.
async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn candidates() -> Vec<ScoredNode> {
    let texts = [
        ("rome", "Rome has ancient ruins and good pasta."),
        ("tokyo", "Tokyo is the capital of Japan."),
        ("paris", "Paris is the capital of France."),
    ];
    texts
        .iter()
        .enumerate()
        .map(|(rank, (id, text))| ScoredNode {
            node: Arc::new(Node {
                id: id.to_string(),
                document_id: format!("{}.txt", id),
                text: text.to_string(),
                start_offset: 0,
                end_offset: text.len(),
                metadata: BTreeMap::new(),
                hierarchy: None,
            }),
            score: 1.0 - rank as f32 * 0.1,
            rank,
        })
        .collect()
}

fn cohere_reranker(base_url: String, credentials: &ResolvedCredentials) -> Arc<dyn Reranker> {
    let config = RerankConfig {
        strategy: Some(RerankStrategy::Cohere),
        base_url: Some(base_url),
        timeout_secs: 5,
        ..RerankConfig::default()
    };
    build_reranker(&config, None, None, credentials, &RetryConfig::none())
        .unwrap()
        .unwrap()
}

fn cross_encoder_reranker(base_url: String, retry: RetryConfig) -> Arc<dyn Reranker> {
    let config = RerankConfig {
        strategy: Some(RerankStrategy::CrossEncoder),
        base_url: Some(base_url),
        timeout_secs: 5,
        ..RerankConfig::default()
    };
    build_reranker(&config, None, None, &ResolvedCredentials::new(), &retry)
        .unwrap()
        .unwrap()
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

// --- Cohere ---

#[tokio::test]
async fn test_cohere_reorders_by_remote_score() {
    let stub = Stub::default();
    let url = serve(stub.clone()).await;
    let credentials = ResolvedCredentials::new().with_key("COHERE_API_KEY", "test-key");
    let reranker = cohere_reranker(url, &credentials);

    let out = reranker
        .rerank("capital of france", candidates(), 2)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].node.id, "paris");
    assert_eq!(out[1].node.id, "tokyo");
    assert_eq!(out[0].rank, 0);
    assert!(out[0].score > out[1].score);
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cohere_bad_key_is_auth_failure() {
    let url = serve(Stub::default()).await;
    let credentials = ResolvedCredentials::new().with_key("COHERE_API_KEY", "wrong");
    let err = cohere_reranker(url, &credentials)
        .rerank("capital", candidates(), 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::External {
            stage: PipelineStage::Rerank,
            source: LlmError::AuthFailed { .. }
        }
    ));
}

#[tokio::test]
async fn test_cohere_missing_key_is_config_error() {
    let config = RerankConfig {
        strategy: Some(RerankStrategy::Cohere),
        ..RerankConfig::default()
    };
    let err = build_reranker(
        &config,
        None,
        None,
        &ResolvedCredentials::new(),
        &RetryConfig::none(),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("COHERE_API_KEY"));
}

#[tokio::test]
async fn test_unreachable_service_surfaces_rerank_stage() {
    let url = closed_port().await;
    let credentials = ResolvedCredentials::new().with_key("COHERE_API_KEY", "test-key");
    let err = cohere_reranker(url, &credentials)
        .rerank("capital", candidates(), 2)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(PipelineStage::Rerank));
}

// --- Cross-encoder ---

#[tokio::test]
async fn test_cross_encoder_scores_every_candidate() {
    let url = serve(Stub::default()).await;
    let out = cross_encoder_reranker(url, RetryConfig::none())
        .rerank("capital of france", candidates(), 3)
        .await
        .unwrap();
    let ids: Vec<&str> = out.iter().map(|r| r.node.id.as_str()).collect();
    assert_eq!(ids, vec!["paris", "tokyo", "rome"]);
    assert!(out.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    assert!(out[2].score < 0.5);
}

#[tokio::test]
async fn test_cross_encoder_retries_server_errors() {
    let stub = Stub {
        fail_first: 2,
        ..Stub::default()
    };
    let url = serve(stub.clone()).await;
    let out = cross_encoder_reranker(url, fast_retry(3))
        .rerank("capital of france", candidates(), 1)
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].node.id, "paris");
    assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cross_encoder_gives_up_after_retries() {
    let stub = Stub {
        fail_first: usize::MAX,
        ..Stub::default()
    };
    let url = serve(stub.clone()).await;
    let err = cross_encoder_reranker(url, fast_retry(1))
        .rerank("capital", candidates(), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::External {
            stage: PipelineStage::Rerank,
            source: LlmError::ServerError { status: 503, .. }
        }
    ));
    assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_candidates_skip_the_network() {
    let url = closed_port().await;
    let out = cross_encoder_reranker(url, RetryConfig::none())
        .rerank("capital", Vec::new(), 3)
        .await
        .unwrap();
    assert!(out.is_empty());
}
