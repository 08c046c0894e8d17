//! End-to-end pool scenarios over the mock backend: admission, dispatch,
//! backpressure, timeouts, scaling, shutdown and memory persistence.

use std::time::Duration;

use ruvltra_engine::{
    BackendKind, GenerateRequest, PoolConfig, SonaConfig, TaskError, TaskType, start_pool,
};

fn mock_config() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 2,
        initial_workers: 1,
        queue_max_length: 16,
        task_timeout: Duration::from_secs(10),
        sona: SonaConfig {
            enabled: false,
            state_dir: None,
            persist_interval: 10,
        },
        http: None,
        native: None,
        embedded: None,
        max_tokens: 64,
        temperature: 0.2,
        mock_latency: Duration::from_millis(10),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mock_only_generate_succeeds() {
    let pool = start_pool(mock_config());

    let res = pool
        .submit(GenerateRequest::new(TaskType::Generate, "hello"))
        .await
        .unwrap();
    assert_eq!(res.backend, BackendKind::Mock);
    assert!(!res.text.is_empty());
    assert_eq!(res.worker_id, "worker-1");
    assert!(res.task_id >= 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_overflow_rejects_third_task() {
    let mut cfg = mock_config();
    cfg.max_workers = 1;
    cfg.queue_max_length = 1;
    cfg.mock_latency = Duration::from_millis(100);
    let pool = start_pool(cfg);

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, "first"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, "second"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    // First is in flight, second occupies the single queue slot.
    let third = pool
        .submit(GenerateRequest::new(TaskType::Generate, "third"))
        .await;
    match third {
        Err(TaskError::QueueOverflow { retry_after_ms, .. }) => assert!(retry_after_ms > 0),
        other => panic!("expected queue overflow, got {other:?}"),
    }

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());

    let status = pool.status().await.unwrap();
    assert_eq!(status.counters.rejected, 1);
    assert_eq!(status.counters.completed, 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_backend_times_out() {
    let mut cfg = mock_config();
    cfg.max_workers = 1;
    cfg.mock_latency = Duration::from_millis(300);
    let pool = start_pool(cfg);

    let mut req = GenerateRequest::new(TaskType::Generate, "slow");
    req.timeout_ms = Some(30);
    let res = pool.submit(req).await;
    assert!(matches!(res, Err(TaskError::Timeout { timeout_ms: 30 })));

    let status = pool.status().await.unwrap();
    assert!(status.counters.timed_out >= 1);
    assert!(status.counters.cancelled >= 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fanout_tasks_are_independent() {
    let mut cfg = mock_config();
    cfg.min_workers = 2;
    cfg.initial_workers = 2;
    cfg.mock_latency = Duration::from_millis(100);
    let pool = start_pool(cfg);

    let doomed = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut req = GenerateRequest::new(TaskType::Generate, "doomed");
            req.timeout_ms = Some(20);
            pool.submit(req).await
        })
    };
    let fine = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, "fine"))
                .await
        })
    };

    assert!(matches!(
        doomed.await.unwrap(),
        Err(TaskError::Timeout { .. })
    ));
    assert!(fine.await.unwrap().is_ok());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn counters_account_for_every_admitted_task() {
    let mut cfg = mock_config();
    cfg.min_workers = 2;
    cfg.initial_workers = 2;
    cfg.mock_latency = Duration::from_millis(50);
    let pool = start_pool(cfg);

    let mut handles = Vec::new();
    for idx in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut req = GenerateRequest::new(TaskType::Generate, format!("task {idx}"));
            if idx % 3 == 0 {
                req.timeout_ms = Some(5);
            }
            pool.submit(req).await
        }));
    }
    for handle in handles {
        let _ = handle.await.unwrap();
    }

    let status = pool.status().await.unwrap();
    let c = status.counters;
    assert_eq!(c.submitted, 6);
    // Timeouts count as cancelled, so the three buckets partition the run.
    assert_eq!(c.completed + c.failed + c.cancelled, 6);
    assert_eq!(c.timed_out, 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_pending_and_running_tasks() {
    let mut cfg = mock_config();
    cfg.max_workers = 1;
    cfg.mock_latency = Duration::from_millis(500);
    let pool = start_pool(cfg);

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, "running"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, "queued"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.shutdown().await;

    assert!(matches!(running.await.unwrap(), Err(TaskError::Cancelled)));
    assert!(matches!(queued.await.unwrap(), Err(TaskError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread")]
async fn scale_clamps_to_configured_bounds() {
    let mut cfg = mock_config();
    cfg.min_workers = 2;
    cfg.max_workers = 4;
    cfg.initial_workers = 2;
    let pool = start_pool(cfg);

    let status = pool.scale(50).await.unwrap();
    assert_eq!(status.workers, 4);

    let status = pool.scale(0).await.unwrap();
    assert_eq!(status.workers, 2);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deep_queue_scales_the_pool_up() {
    let mut cfg = mock_config();
    cfg.min_workers = 1;
    cfg.max_workers = 3;
    cfg.initial_workers = 1;
    cfg.mock_latency = Duration::from_millis(100);
    let pool = start_pool(cfg);

    let mut handles = Vec::new();
    for idx in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.submit(GenerateRequest::new(TaskType::Generate, format!("task {idx}")))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = pool.status().await.unwrap();
    assert!(status.workers > 1, "expected scale-up, got {}", status.workers);

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_survives_pool_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = mock_config();
    cfg.max_workers = 1;
    cfg.sona = SonaConfig {
        enabled: true,
        state_dir: Some(dir.path().to_path_buf()),
        persist_interval: 1,
    };

    let pool = start_pool(cfg.clone());
    let mut first = GenerateRequest::new(TaskType::Generate, "build a tokenizer");
    first.language = Some("rust".to_string());
    pool.submit(first).await.unwrap();
    let mut second = GenerateRequest::new(TaskType::Generate, "build a scheduler");
    second.language = Some("python".to_string());
    pool.submit(second).await.unwrap();
    pool.shutdown().await;

    let pool = start_pool(cfg);
    let stats = pool
        .sona_stats(Some("worker-1".to_string()))
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    let memory = &stats[0];
    assert!(memory.interactions >= 2, "interactions = {}", memory.interactions);
    assert!(memory.pattern_count >= 2);
    assert!(
        memory.top_patterns.iter().any(|p| p.key == "task:generate"),
        "expected task:generate among {:?}",
        memory.top_patterns
    );
    pool.shutdown().await;
}
