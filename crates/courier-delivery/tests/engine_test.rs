//! End-to-end pipeline scenarios over in-memory stores.
//!
//! Deterministic scenarios drive single batches with `run_*_once` on a
//! manual clock. Lifecycle tests run the background loops on a paused tokio
//! runtime.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use courier_core::{
    ChatId, ClaimRequest, Clock, NewInboundUpdate, NewOutboundMessage, OutboundMessage, QueueEntry,
    QueueStatus, UpdateId,
};
use courier_delivery::{
    storage::QueueStore, Handler, IngestOutcome, OutboundHandler, Outcome, PipelineConfig,
    PipelineError, QueueWorker, RateLimiter, RetryPolicy, WorkerConfig,
};
use courier_testing::{
    answer_callback, fast_config, send_message, RealClock, RecordingRouter, ScriptedApiClient,
    TestEnv, UpdateBuilder,
};
use tokio_util::sync::CancellationToken;

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached in time");
}

fn paused_env() -> TestEnv {
    TestEnv::with_clock(Arc::new(RealClock::new()))
}

#[tokio::test]
async fn inbound_update_is_routed_exactly_once() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    let ingestor = env.ingestor();

    let raw = UpdateBuilder::message(100).chat(5).raw();
    let first = ingestor.ingest(&raw).await?;
    let second = ingestor.ingest(&raw).await?;

    let IngestOutcome::Enqueued { entry_id, .. } = first else {
        panic!("expected first ingestion to enqueue, got {first:?}");
    };
    assert_eq!(second, IngestOutcome::Duplicate { update_id: UpdateId(100) });

    assert_eq!(pipeline.run_inbound_once().await?, 1);
    assert_eq!(pipeline.run_inbound_once().await?, 0);

    assert_eq!(env.router.seen_ids().await, vec![UpdateId(100)]);
    let row = env.inbound.get(entry_id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Processed);
    assert_eq!(row.state.attempts, 1);
    assert!(row.state.processed_at.is_some());
    assert!(env.guard.contains(UpdateId(100)).await);
    Ok(())
}

#[tokio::test]
async fn transient_router_failure_is_retried_after_backoff() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.router.push_transient("session store unavailable").await;

    env.ingestor().ingest(&UpdateBuilder::callback_query(7).raw()).await?;
    pipeline.run_inbound_once().await?;

    let row = env.inbound.entries().await.remove(0);
    assert_eq!(row.state.status, QueueStatus::Retry);
    assert_eq!(row.state.last_error.as_deref(), Some("session store unavailable"));
    assert!(row.state.next_attempt_at.is_some());

    assert_eq!(pipeline.run_inbound_once().await?, 0);
    env.advance(Duration::from_secs(2));
    assert_eq!(pipeline.run_inbound_once().await?, 1);

    let row = env.inbound.get(row.id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Processed);
    assert_eq!(row.state.attempts, 2);
    assert_eq!(env.router.seen_ids().await, vec![UpdateId(7), UpdateId(7)]);

    let stats = pipeline.stats().await;
    assert_eq!(stats.inbound.retried, 1);
    assert_eq!(stats.inbound.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn rejected_and_malformed_updates_fail_without_retry() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.router.push_rejected("unknown command").await;

    env.ingestor().ingest(&UpdateBuilder::message(1).raw()).await?;
    let malformed = env
        .inbound
        .enqueue(
            NewInboundUpdate { external_id: UpdateId(2), payload: "not json".into() },
            env.clock.now_utc(),
        )
        .await?
        .unwrap();

    assert_eq!(pipeline.run_inbound_once().await?, 2);

    for row in env.inbound.entries().await {
        assert_eq!(row.state.status, QueueStatus::Failed);
        assert_eq!(row.state.attempts, 1);
    }
    let malformed = env.inbound.get(malformed.id).await.unwrap();
    assert!(malformed.state.last_error.unwrap().starts_with("malformed update"));
    assert_eq!(env.router.seen_ids().await, vec![UpdateId(1)]);

    env.advance(Duration::from_secs(3600));
    assert_eq!(pipeline.run_inbound_once().await?, 0);
    Ok(())
}

#[tokio::test]
async fn outbound_transient_failure_retries_then_sends() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.api.push_transport_error("request failed: connection reset").await;

    let id = env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;
    assert_eq!(pipeline.run_outbound_once().await?, 1);

    let failed_at = env.clock.now_utc();
    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Retry);
    assert_eq!(row.state.attempts, 1);
    assert_eq!(row.state.next_attempt_at, Some(failed_at + chrono::Duration::seconds(2)));

    assert_eq!(pipeline.run_outbound_once().await?, 0);
    env.advance(Duration::from_secs(2));
    assert_eq!(pipeline.run_outbound_once().await?, 1);

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Sent);
    assert_eq!(row.state.attempts, 2);
    assert_eq!(env.api.calls_to("sendMessage").await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn client_errors_fail_immediately() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.api.push_error(400, "Bad Request: chat not found").await;

    let id = env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;
    pipeline.run_outbound_once().await?;

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Failed);
    assert_eq!(row.state.attempts, 1);
    assert_eq!(row.state.last_error.as_deref(), Some("400: Bad Request: chat not found"));

    env.advance(Duration::from_secs(3600));
    assert_eq!(pipeline.run_outbound_once().await?, 0);
    assert_eq!(env.api.call_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn server_errors_stop_at_the_attempt_ceiling() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    for _ in 0..5 {
        env.api.push_error(502, "Bad Gateway").await;
    }

    let id = env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;
    for _ in 0..5 {
        pipeline.run_outbound_once().await?;
        env.advance(Duration::from_secs(300));
    }

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Failed);
    assert_eq!(row.state.attempts, 3);
    assert_eq!(row.state.last_error.as_deref(), Some("502: Bad Gateway"));
    assert_eq!(env.api.call_count().await, 3);

    let stats = pipeline.stats().await;
    assert_eq!(stats.outbound.claimed, 3);
    assert_eq!(stats.outbound.retried, 2);
    assert_eq!(stats.outbound.failed, 1);
    Ok(())
}

#[tokio::test]
async fn rate_limited_send_waits_at_least_retry_after() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.api.push_rate_limited(30).await;

    let id = env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;
    let before = env.clock.now_utc();
    pipeline.run_outbound_once().await?;

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Retry);
    assert!(row.state.next_attempt_at.unwrap() >= before + chrono::Duration::seconds(30));

    env.advance(Duration::from_secs(29));
    assert_eq!(pipeline.run_outbound_once().await?, 0);
    env.advance(Duration::from_secs(1));
    assert_eq!(pipeline.run_outbound_once().await?, 1);

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Sent);
    assert_eq!(row.state.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn failed_callback_answers_are_not_retried() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.api.push_error(500, "Internal Server Error").await;

    let id = env
        .enqueuer()
        .enqueue_send(ChatId(5), "answerCallbackQuery", &answer_callback("cb-1"))
        .await?;
    pipeline.run_outbound_once().await?;

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Failed);
    assert_eq!(row.state.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn malformed_outbound_payload_fails_without_calling_the_api() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    let row = env
        .outbound
        .enqueue(
            NewOutboundMessage {
                destination: ChatId(5),
                method: "sendMessage".into(),
                payload: "{".into(),
            },
            env.clock.now_utc(),
        )
        .await?
        .unwrap();

    pipeline.run_outbound_once().await?;

    let row = env.outbound.get(row.id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Failed);
    assert!(row.state.last_error.unwrap().starts_with("malformed payload"));
    assert_eq!(env.api.call_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn crashed_worker_rows_are_reclaimed_after_the_lease() -> Result<()> {
    let env = TestEnv::new();
    let config = fast_config();
    let pipeline = env.pipeline(config.clone());

    let id = env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;

    let crashed = env
        .outbound
        .claim_batch(ClaimRequest {
            limit: 10,
            now: env.clock.now_utc(),
            lease: config.outbound.lease_chrono(),
            max_attempts: config.outbound.max_attempts,
        })
        .await?
        .remove(0)
        .claim()
        .unwrap();

    assert_eq!(pipeline.run_outbound_once().await?, 0);
    env.advance(config.outbound.lease + Duration::from_secs(1));
    assert_eq!(pipeline.run_outbound_once().await?, 1);

    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Sent);
    assert_eq!(row.state.attempts, 2);

    assert!(!env.outbound.mark_done(crashed, env.clock.now_utc()).await?);
    Ok(())
}

#[tokio::test]
async fn sends_to_one_chat_are_paced() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    let enqueuer = env.enqueuer();

    enqueuer.enqueue_send(ChatId(9), "sendMessage", &send_message(9, "one")).await?;
    enqueuer.enqueue_send(ChatId(9), "sendMessage", &send_message(9, "two")).await?;
    enqueuer.enqueue_send(ChatId(10), "sendMessage", &send_message(10, "other")).await?;

    assert_eq!(pipeline.run_outbound_once().await?, 3);

    let mut chat_nine: Vec<_> =
        env.api.calls().await.into_iter().filter(|call| call.chat_id() == Some(9)).collect();
    chat_nine.sort_by_key(|call| call.at);
    assert_eq!(chat_nine.len(), 2);
    assert!(chat_nine[1].at.duration_since(chat_nine[0].at) >= Duration::from_secs(1));
    assert_eq!(env.outbound.count_by_status(QueueStatus::Sent).await, 3);
    Ok(())
}

#[tokio::test]
async fn send_is_skipped_when_the_lease_ran_out_while_pacing() -> Result<()> {
    let env = TestEnv::new();
    let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10), env.clock.clone()));
    let handler = OutboundHandler::new(env.api.clone(), limiter.clone(), env.clock.clone());

    env.enqueuer().enqueue_send(ChatId(9), "sendMessage", &send_message(9, "late")).await?;
    let entry = env
        .outbound
        .claim_batch(ClaimRequest {
            limit: 1,
            now: env.clock.now_utc(),
            lease: chrono::Duration::seconds(5),
            max_attempts: 3,
        })
        .await?
        .remove(0);

    // Another send to the chat holds the slot for the next ten seconds.
    limiter.acquire(ChatId(9)).await;
    let outcome = handler.handle(&entry).await;

    assert!(matches!(outcome, Outcome::Retry { .. }), "got {outcome:?}");
    assert_eq!(env.api.call_count().await, 0);
    Ok(())
}

struct PanickingHandler;

#[async_trait]
impl Handler<OutboundMessage> for PanickingHandler {
    async fn handle(&self, _entry: &OutboundMessage) -> Outcome {
        panic!("handler bug")
    }
}

#[tokio::test]
async fn panicking_handler_does_not_stay_in_flight() -> Result<()> {
    let env = TestEnv::new();
    let worker = QueueWorker::new(
        "outbound",
        env.outbound.clone(),
        Arc::new(PanickingHandler),
        fast_config().outbound,
        RetryPolicy::default(),
        env.clock.clone(),
        CancellationToken::new(),
    );
    env.enqueuer().enqueue_send(ChatId(5), "sendMessage", &send_message(5, "hi")).await?;

    let error = worker.run_once().await.unwrap_err();
    assert!(matches!(error, PipelineError::WorkerPanic { .. }));

    let stats = worker.stats().await;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn claim_errors_surface_from_run_once() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.outbound.inject_claim_error("connection refused").await;

    let error = pipeline.run_outbound_once().await.unwrap_err();
    assert!(matches!(error, PipelineError::Database { .. }));
    assert!(error.is_transient());

    assert_eq!(pipeline.run_outbound_once().await?, 0);
    Ok(())
}

#[tokio::test]
async fn enqueuer_rejects_empty_methods_and_stores_json() -> Result<()> {
    let env = TestEnv::new();
    let enqueuer = env.enqueuer();

    let error = enqueuer.enqueue_send(ChatId(1), " ", &send_message(1, "x")).await.unwrap_err();
    assert!(matches!(error, PipelineError::Configuration { .. }));

    let id = enqueuer.enqueue_send(ChatId(1), "sendMessage", &send_message(1, "x")).await?;
    let row = env.outbound.get(id).await.unwrap();
    assert_eq!(row.state.status, QueueStatus::Pending);
    assert_eq!(row.state.attempts, 0);
    assert_eq!(row.destination, ChatId(1));
    assert_eq!(serde_json::from_str::<serde_json::Value>(&row.payload)?, send_message(1, "x"));
    Ok(())
}

#[tokio::test]
async fn depth_counts_rows_not_yet_terminal() -> Result<()> {
    let env = TestEnv::new();
    let pipeline = env.pipeline(fast_config());
    env.api.push_error(400, "Bad Request").await;

    env.ingestor().ingest(&UpdateBuilder::message(1).raw()).await?;
    env.enqueuer().enqueue_send(ChatId(1), "sendMessage", &send_message(1, "a")).await?;
    env.enqueuer().enqueue_send(ChatId(2), "sendMessage", &send_message(2, "b")).await?;

    let depth = pipeline.depth().await?;
    assert_eq!((depth.inbound, depth.outbound), (1, 2));

    pipeline.run_outbound_once().await?;
    let depth = pipeline.depth().await?;
    assert_eq!((depth.inbound, depth.outbound), (1, 0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn background_loops_drain_both_queues() -> Result<()> {
    let env = paused_env();
    let mut pipeline = env.pipeline(fast_config());
    pipeline.start()?;
    let env = &env;

    for id in 1..=3 {
        env.ingestor().ingest(&UpdateBuilder::message(id).chat(id).raw()).await?;
        env.enqueuer().enqueue_send(ChatId(id), "sendMessage", &send_message(id, "hi")).await?;
    }

    wait_until(|| async move {
        env.inbound.count_by_status(QueueStatus::Processed).await == 3
            && env.outbound.count_by_status(QueueStatus::Sent).await == 3
    })
    .await;

    let stats = pipeline.stats().await;
    assert_eq!(stats.inbound.succeeded, 3);
    assert_eq!(stats.outbound.succeeded, 3);
    assert_eq!(stats.outbound.in_flight, 0);

    pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn starting_twice_is_rejected() -> Result<()> {
    let env = paused_env();
    let mut pipeline = env.pipeline(fast_config());

    pipeline.start()?;
    assert!(matches!(pipeline.start(), Err(PipelineError::Configuration { .. })));

    pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_configured_bound() -> Result<()> {
    let clock = Arc::new(RealClock::new());
    let env = TestEnv::with_clock(clock.clone())
        .with_api(ScriptedApiClient::new(clock).with_latency(Duration::from_millis(500)));
    let config = PipelineConfig {
        outbound: WorkerConfig { max_concurrency: 3, ..fast_config().outbound },
        ..fast_config()
    };
    let mut pipeline = env.pipeline(config);

    for chat in 0..12 {
        env.enqueuer().enqueue_send(ChatId(chat), "sendMessage", &send_message(chat, "hi")).await?;
    }
    pipeline.start()?;

    let env = &env;
    wait_until(|| async move { env.outbound.count_by_status(QueueStatus::Sent).await == 12 }).await;

    assert!(env.api.max_in_flight() <= 3, "max in flight {}", env.api.max_in_flight());
    assert!(env.api.max_in_flight() > 1);

    pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn paced_rows_are_sent_once_despite_a_short_configured_lease() -> Result<()> {
    let env = paused_env();
    let config = PipelineConfig {
        outbound: WorkerConfig {
            lease: Duration::from_secs(5),
            max_concurrency: 8,
            batch_size: 10,
            ..fast_config().outbound
        },
        destination_interval: Duration::from_secs(1),
        ..fast_config()
    };
    let mut pipeline = env.pipeline(config);
    let effective = pipeline.config().clone();
    assert!(effective.outbound.lease >= Duration::from_secs(8) + effective.call_timeout);

    for n in 0..8 {
        let text = format!("message {n}");
        env.enqueuer().enqueue_send(ChatId(9), "sendMessage", &send_message(9, &text)).await?;
    }
    pipeline.start()?;

    let env = &env;
    wait_until(|| async move { env.outbound.count_by_status(QueueStatus::Sent).await == 8 }).await;
    tokio::time::sleep(effective.outbound.lease).await;

    assert_eq!(env.api.calls_to("sendMessage").await.len(), 8);
    let stats = pipeline.stats().await;
    assert_eq!(stats.outbound.claimed, 8);
    assert_eq!(stats.outbound.superseded, 0);

    pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_rows() -> Result<()> {
    let env = paused_env().with_router(RecordingRouter::new().with_latency(Duration::from_secs(2)));
    let mut pipeline = env.pipeline(fast_config());

    env.ingestor().ingest(&UpdateBuilder::message(1).raw()).await?;
    pipeline.start()?;
    let env = &env;
    wait_until(|| async move { !env.router.seen_ids().await.is_empty() }).await;

    pipeline.shutdown().await?;

    assert_eq!(env.inbound.count_by_status(QueueStatus::Processed).await, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_and_leaves_rows_to_their_lease() -> Result<()> {
    let env =
        paused_env().with_router(RecordingRouter::new().with_latency(Duration::from_secs(3600)));
    let config = PipelineConfig { shutdown_timeout: Duration::from_secs(1), ..fast_config() };
    let mut pipeline = env.pipeline(config);

    env.ingestor().ingest(&UpdateBuilder::message(1).raw()).await?;
    pipeline.start()?;
    let env = &env;
    wait_until(|| async move { !env.router.seen_ids().await.is_empty() }).await;

    let error = pipeline.shutdown().await.unwrap_err();
    assert!(matches!(error, PipelineError::ShutdownTimeout { .. }));

    let row = env.inbound.entries().await.remove(0);
    assert_eq!(row.state.status, QueueStatus::Processing);
    assert!(row.state.locked_until.is_some());
    Ok(())
}
