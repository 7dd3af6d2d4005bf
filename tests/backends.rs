use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use livetl::translate::azure::{AzureClient, AzureConfig};
use livetl::translate::chat::{ChatClient, ChatConfig, ChatEncoding};
use livetl::{RetryPolicy, TranslateError, TranslationBackend};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Local stand-in for the remote services. Records what it was sent.
#[derive(Default)]
struct FakeService {
    dictionary: HashMap<String, String>,
    requests: Mutex<Vec<String>>,
    headers: Mutex<Vec<HeaderMap>>,
    queries: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeService {
    fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            dictionary: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::default()
        })
    }

    fn lookup(&self, text: &str) -> String {
        self.dictionary
            .get(text)
            .cloned()
            .unwrap_or_else(|| text.to_string())
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn count(&self, content: &str) -> usize {
        self.requests().iter().filter(|r| r.as_str() == content).count()
    }
}

/// Chat completions. `坏` always fails, `慢` answers late; JSON arrays are
/// answered in reverse order inside a code fence.
async fn chat_completions(
    State(service): State<Arc<FakeService>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let content = body["messages"][1]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    service.requests.lock().push(content.clone());
    service.headers.lock().push(headers);

    if content == "坏" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream overloaded").into_response();
    }
    if content == "慢" {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let reply = match serde_json::from_str::<Vec<Value>>(&content) {
        Ok(items) => {
            let mut translated: Vec<Value> = items
                .iter()
                .map(|item| {
                    json!({
                        "id": item["id"],
                        "text": service.lookup(item["text"].as_str().unwrap_or_default()),
                    })
                })
                .collect();
            translated.reverse();
            format!("```json\n{}\n```", Value::Array(translated))
        }
        Err(_) => service.lookup(&content),
    };
    Json(json!({ "choices": [{ "message": { "role": "assistant", "content": reply } }] }))
        .into_response()
}

async fn azure_translate(
    State(service): State<Arc<FakeService>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Vec<Value>>,
) -> Response {
    service.queries.lock().push(query);
    service.headers.lock().push(headers);
    let items: Vec<Value> = body
        .iter()
        .map(|item| {
            let text = item["Text"].as_str().unwrap_or_default();
            service.requests.lock().push(text.to_string());
            json!({ "translations": [{ "text": service.lookup(text), "to": "en" }] })
        })
        .collect();
    Json(Value::Array(items)).into_response()
}

/// Serve `service` on an ephemeral port and return its base URL.
async fn serve(service: Arc<FakeService>) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/translate", post(azure_translate))
        .with_state(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn chat_client(base: &str, encoding: ChatEncoding) -> ChatClient {
    let config = ChatConfig {
        endpoint: format!("{base}/v1"),
        api_key: Some("test-key".into()),
        encoding,
        ..ChatConfig::default()
    };
    ChatClient::new(&config, TIMEOUT).unwrap()
}

fn policy(max_retry_count: u32) -> RetryPolicy {
    RetryPolicy {
        max_retry_count,
        retry_interval_ms: 1,
    }
}

fn frags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn parallel_chat_joins_results_in_input_order() {
    let service = FakeService::new(&[("慢", "Slow"), ("快", "Fast"), ("你好", "Hello")]);
    let base = serve(service.clone()).await;
    let client = chat_client(&base, ChatEncoding::Parallel);

    let out = client
        .translate(&frags(&["慢", "快", "你好"]), &policy(0))
        .await
        .unwrap();

    assert_eq!(out, vec!["Slow", "Fast", "Hello"]);
    let mut sent = service.requests();
    sent.sort();
    let mut expected = frags(&["慢", "快", "你好"]);
    expected.sort();
    assert_eq!(sent, expected);
}

#[tokio::test]
async fn parallel_chat_fails_the_group_when_one_request_exhausts_retries() {
    let service = FakeService::new(&[("你好", "Hello")]);
    let base = serve(service.clone()).await;
    let client = chat_client(&base, ChatEncoding::Parallel);

    let result = client.translate(&frags(&["你好", "坏"]), &policy(1)).await;

    match result {
        Err(TranslateError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, TranslateError::Status { status: 500, .. }));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(service.count("坏"), 2);
    assert_eq!(service.count("你好"), 1);
}

#[tokio::test]
async fn json_chat_sends_one_request_and_orders_by_id() {
    let service = FakeService::new(&[("你好", "Hello"), ("再见", "Goodbye")]);
    let base = serve(service.clone()).await;
    let client = chat_client(&base, ChatEncoding::Json);

    let out = client
        .translate(&frags(&["你好", "再见"]), &policy(0))
        .await
        .unwrap();

    assert_eq!(out, vec!["Hello", "Goodbye"]);
    assert_eq!(
        service.requests(),
        vec![r#"[{"id":0,"text":"你好"},{"id":1,"text":"再见"}]"#.to_string()]
    );
    let headers = service.headers.lock();
    assert_eq!(headers[0]["authorization"], "Bearer test-key");
}

#[tokio::test]
async fn azure_posts_one_array_per_batch() {
    let service = FakeService::new(&[("开始", "Start"), ("结束", "End")]);
    let base = serve(service.clone()).await;
    let client = AzureClient::new(
        &AzureConfig {
            endpoint: base,
            api_key: Some("azure-key".into()),
            region: Some("eastasia".into()),
            ..AzureConfig::default()
        },
        TIMEOUT,
    )
    .unwrap();

    let out = client
        .translate(&frags(&["开始", "结束"]), &policy(0))
        .await
        .unwrap();

    assert_eq!(out, vec!["Start", "End"]);
    assert_eq!(service.requests(), frags(&["开始", "结束"]));
    let queries = service.queries.lock();
    let query = &queries[0];
    assert_eq!(query["api-version"], "3.0");
    assert_eq!(query["to"], "en");
    assert!(!query.contains_key("from"));
    let headers = service.headers.lock();
    assert_eq!(headers[0]["ocp-apim-subscription-key"], "azure-key");
    assert_eq!(headers[0]["ocp-apim-subscription-region"], "eastasia");
}
