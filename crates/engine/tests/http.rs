//! Remote-backend behavior against a stubbed HTTP endpoint: retry
//! recovery, circuit opening, short-circuiting and probe recovery.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ruvltra_engine::{
    BackendKind, GenerateRequest, HttpConfig, PoolConfig, SonaConfig, TaskType, start_pool,
};

use ruvltra_core::HttpFormat;

fn http_config(endpoint: String, max_retries: u32, threshold: u32, cooldown: Duration) -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 1,
        initial_workers: 1,
        queue_max_length: 16,
        task_timeout: Duration::from_secs(10),
        sona: SonaConfig {
            enabled: false,
            state_dir: None,
            persist_interval: 10,
        },
        http: Some(HttpConfig {
            endpoint,
            api_key: None,
            model: Some("test-model".to_string()),
            format: HttpFormat::Auto,
            timeout: Duration::from_secs(5),
            max_retries,
            retry_base: Duration::from_millis(10),
            circuit_failure_threshold: threshold,
            circuit_cooldown: cooldown,
        }),
        native: None,
        embedded: None,
        max_tokens: 64,
        temperature: 0.2,
        mock_latency: Duration::from_millis(5),
    }
}

fn chat_body(content: &str) -> serde_json::Value {
    json!({
        "model": "test-model",
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 5 },
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_recovers_after_one_503() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("ok-from-http")))
        .expect(1)
        .mount(&server)
        .await;

    let pool = start_pool(http_config(
        format!("{}/v1/chat/completions", server.uri()),
        1,
        5,
        Duration::from_secs(30),
    ));

    let res = pool
        .submit(GenerateRequest::new(TaskType::Generate, "hello"))
        .await
        .unwrap();
    assert_eq!(res.backend, BackendKind::Http);
    assert_eq!(res.text, "ok-from-http");
    assert_eq!(res.model, "test-model");

    pool.shutdown().await;
    // Dropping the server verifies both expectations: exactly two wire hits.
}

#[tokio::test(flavor = "multi_thread")]
async fn circuit_opens_then_recovers_after_cooldown() {
    let server = MockServer::start().await;
    let cooldown = Duration::from_millis(500);
    let pool = start_pool(http_config(
        format!("{}/v1/chat/completions", server.uri()),
        0,
        2,
        cooldown,
    ));

    {
        let failing = Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount_as_scoped(&server)
            .await;

        // Two failed tries open the circuit; both requests fall over to mock.
        for _ in 0..2 {
            let res = pool
                .submit(GenerateRequest::new(TaskType::Generate, "hello"))
                .await
                .unwrap();
            assert_eq!(res.backend, BackendKind::Mock);
        }

        // Circuit is open: this submit must not touch the wire at all. A
        // third hit would fail the scoped mock's exactly-2 expectation.
        let res = pool
            .submit(GenerateRequest::new(TaskType::Generate, "hello"))
            .await
            .unwrap();
        assert_eq!(res.backend, BackendKind::Mock);

        drop(failing);
    }

    // The circuit short-circuits without a wire call, so the status note
    // reports the remote backend as degraded.
    let status = pool.status().await.unwrap();
    let http_status = status.worker_stats[0]
        .backends
        .iter()
        .find(|b| b.backend == BackendKind::Http)
        .unwrap();
    assert!(http_status.note.contains("circuit open"), "{}", http_status.note);

    tokio::time::sleep(cooldown + Duration::from_millis(100)).await;

    {
        let _healthy = Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("recovered")))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        // Cooldown elapsed: exactly one probe goes out and restores the circuit.
        let res = pool
            .submit(GenerateRequest::new(TaskType::Generate, "hello"))
            .await
            .unwrap();
        assert_eq!(res.backend, BackendKind::Http);
        assert_eq!(res.text, "recovered");
    }

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn client_error_fails_fast_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    // Two retries configured, but a 401 is not retryable: one wire hit.
    let pool = start_pool(http_config(
        format!("{}/v1/chat/completions", server.uri()),
        2,
        5,
        Duration::from_secs(30),
    ));

    let res = pool
        .submit(GenerateRequest::new(TaskType::Generate, "hello"))
        .await
        .unwrap();
    assert_eq!(res.backend, BackendKind::Mock);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_completion_shape_is_negotiated_from_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "content": "raw-output" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let pool = start_pool(http_config(
        format!("{}/completion", server.uri()),
        0,
        5,
        Duration::from_secs(30),
    ));

    let res = pool
        .submit(GenerateRequest::new(TaskType::Generate, "hello"))
        .await
        .unwrap();
    assert_eq!(res.backend, BackendKind::Http);
    assert_eq!(res.text, "raw-output");

    pool.shutdown().await;
}
