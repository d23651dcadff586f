//! Outbound queue behaviour under a paused clock: pacing, retry classes, head-of-line
//! requeue, capacity and worker lifecycle.

mod common;

use common::{forbidden, rate_limited, server_error, ScriptedApi};
use lib::channels::{OutboundMessage, SendError};
use lib::config::OutboundConfig;
use lib::error::ErrorKind;
use lib::metrics::CounterMetrics;
use lib::outbound::{Delivery, EnqueueError, OutboundQueue, OutboundWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn setup(
    config: OutboundConfig,
    api: ScriptedApi,
) -> (OutboundQueue, OutboundWorker, Arc<ScriptedApi>, Arc<CounterMetrics>) {
    let api = Arc::new(api);
    let metrics = Arc::new(CounterMetrics::new());
    let (queue, worker) = OutboundQueue::new(&config, api.clone(), metrics.clone());
    (queue, worker, api, metrics)
}

fn texts(attempts: &[common::Attempt]) -> Vec<&str> {
    attempts.iter().map(|a| a.text.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn three_messages_to_one_conversation_wait_two_spacings() {
    let (queue, worker, api, metrics) = setup(OutboundConfig::default(), ScriptedApi::new());
    for text in ["a", "b", "c"] {
        queue.send("100", OutboundMessage::text(text)).unwrap();
    }

    let start = Instant::now();
    worker.drain().await;
    let elapsed = start.elapsed();
    assert!(elapsed >= ms(700) && elapsed < ms(750), "drained in {:?}", elapsed);

    let sent = api.delivered();
    assert_eq!(texts(&sent), ["a", "b", "c"]);
    for pair in sent.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= ms(350));
    }
    let snap = metrics.snapshot();
    assert_eq!(snap.queued, 3);
    assert_eq!(snap.messages_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn different_conversations_are_not_spaced() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    for conv in ["1", "2", "3"] {
        queue.send(conv, OutboundMessage::text(conv)).unwrap();
    }
    let start = Instant::now();
    worker.drain().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(api.delivered().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn spacing_is_measured_from_the_last_delivery() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    queue.send("100", OutboundMessage::text("first")).unwrap();
    worker.drain().await;

    tokio::time::advance(ms(200)).await;
    queue.send("100", OutboundMessage::text("second")).unwrap();
    let start = Instant::now();
    worker.drain().await;
    assert_eq!(start.elapsed(), ms(150));

    let sent = api.delivered();
    assert_eq!(sent[1].at.duration_since(sent[0].at), ms(350));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_twice_then_delivered_with_growing_backoff() {
    let api = ScriptedApi::new();
    api.script_sends([Err(rate_limited()), Err(rate_limited()), Ok(())]);
    let (queue, worker, api, metrics) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("hello")).unwrap();

    let start = Instant::now();
    assert_eq!(worker.deliver_next().await, Some(Delivery::Requeued { delay: ms(1000) }));
    assert_eq!(queue.status().queue_length, 1);
    assert_eq!(worker.deliver_next().await, Some(Delivery::Requeued { delay: ms(2000) }));
    assert_eq!(worker.deliver_next().await, Some(Delivery::Sent));
    assert_eq!(worker.deliver_next().await, None);
    assert_eq!(start.elapsed(), ms(3000));

    assert_eq!(api.attempts().len(), 3);
    let snap = metrics.snapshot();
    assert_eq!(snap.retries, 2);
    assert_eq!(snap.messages_sent, 1);
    assert_eq!(snap.platform_rate_limited, 2);
    assert_eq!(snap.rate_limited, 0);
    assert_eq!(snap.errors_of(ErrorKind::RateLimited), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_three_times_then_delivered_on_fourth_attempt() {
    let api = ScriptedApi::new();
    api.script_sends([
        Err(rate_limited()),
        Err(rate_limited()),
        Err(rate_limited()),
        Ok(()),
    ]);
    let (queue, worker, api, _) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("hello")).unwrap();

    let mut delays = Vec::new();
    while let Some(outcome) = worker.deliver_next().await {
        if let Delivery::Requeued { delay } = outcome {
            delays.push(delay);
        }
    }
    assert_eq!(delays, [ms(1000), ms(2000), ms(4000)]);
    assert_eq!(api.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retries_are_bounded() {
    let api = ScriptedApi::new();
    api.script_sends((0..5).map(|_| Err(rate_limited())));
    let (queue, worker, api, metrics) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("doomed")).unwrap();

    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.deliver_next().await {
        outcomes.push(outcome);
    }
    let requeues = outcomes
        .iter()
        .filter(|o| matches!(o, Delivery::Requeued { .. }))
        .count();
    assert_eq!(requeues, 3);
    assert_eq!(
        outcomes.last(),
        Some(&Delivery::Dropped {
            kind: ErrorKind::RateLimited
        })
    );
    assert_eq!(api.attempts().len(), 4);
    assert_eq!(queue.status().queue_length, 0);

    let snap = metrics.snapshot();
    assert_eq!(snap.retries, 3);
    assert_eq!(snap.errors_of(ErrorKind::RateLimited), 1);
}

#[tokio::test(start_paused = true)]
async fn platform_retry_after_extends_the_backoff() {
    let api = ScriptedApi::new();
    api.script_sends([Err(SendError::from_code(
        429,
        "Too Many Requests: retry after 5",
        Some(Duration::from_secs(5)),
    ))]);
    let (queue, worker, _, _) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("x")).unwrap();

    assert_eq!(
        worker.deliver_next().await,
        Some(Delivery::Requeued {
            delay: Duration::from_secs(5)
        })
    );
}

#[tokio::test(start_paused = true)]
async fn server_error_gets_exactly_one_retry() {
    let api = ScriptedApi::new();
    api.script_sends([Err(server_error()), Err(server_error())]);
    let (queue, worker, api, metrics) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("x")).unwrap();

    assert_eq!(worker.deliver_next().await, Some(Delivery::Requeued { delay: ms(1000) }));
    assert_eq!(
        worker.deliver_next().await,
        Some(Delivery::Dropped {
            kind: ErrorKind::RetryableServer
        })
    );
    assert_eq!(worker.deliver_next().await, None);
    assert_eq!(api.attempts().len(), 2);
    assert_eq!(metrics.snapshot().errors_of(ErrorKind::RetryableServer), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_retried_like_a_server_error() {
    let api = ScriptedApi::new();
    api.script_sends([Err(SendError::Transport("connection reset".into())), Ok(())]);
    let (queue, worker, api, _) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("x")).unwrap();

    worker.drain().await;
    assert_eq!(api.attempts().len(), 2);
    assert_eq!(api.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn permanent_error_drops_immediately_without_backoff() {
    let api = ScriptedApi::new();
    api.script_sends([Err(forbidden())]);
    let (queue, worker, api, metrics) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("blocked")).unwrap();
    queue.send("200", OutboundMessage::text("fine")).unwrap();
    assert_eq!(queue.status().queue_length, 2);

    let start = Instant::now();
    assert_eq!(
        worker.deliver_next().await,
        Some(Delivery::Dropped {
            kind: ErrorKind::Permanent
        })
    );
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(queue.status().queue_length, 1);

    let snap = metrics.snapshot();
    assert_eq!(snap.errors_of(ErrorKind::Permanent), 1);
    assert_eq!(snap.retries, 0);
    assert_eq!(
        api.attempts()
            .iter()
            .filter(|a| a.conversation_id == "100")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn retried_message_blocks_the_head_of_the_queue() {
    let api = ScriptedApi::new();
    api.script_sends([Err(rate_limited())]);
    let (queue, worker, api, _) = setup(OutboundConfig::default(), api);
    queue.send("1", OutboundMessage::text("a")).unwrap();
    queue.send("2", OutboundMessage::text("b")).unwrap();

    let start = Instant::now();
    worker.drain().await;

    let attempts = api.attempts();
    assert_eq!(texts(&attempts), ["a", "a", "b"]);
    assert!(!attempts[0].ok);
    // "b" waited out "a"'s backoff even though it targets another conversation.
    assert!(attempts[2].at.duration_since(start) >= ms(1000));
}

#[tokio::test(start_paused = true)]
async fn draining_an_empty_queue_is_a_no_op() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    let start = Instant::now();
    assert_eq!(worker.deliver_next().await, None);
    worker.drain().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(!queue.status().processing);
    assert!(api.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_discards_queue_and_pacing_state() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    queue.send("100", OutboundMessage::text("sent")).unwrap();
    worker.drain().await;
    assert_eq!(queue.status().conversations, 1);

    for text in ["x", "y", "z"] {
        queue.send("100", OutboundMessage::text(text)).unwrap();
    }
    assert_eq!(queue.clear(), 3);
    let status = queue.status();
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.conversations, 0);

    worker.drain().await;
    assert_eq!(api.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_new_messages() {
    let config = OutboundConfig {
        capacity: 2,
        ..OutboundConfig::default()
    };
    let (queue, _worker, _, metrics) = setup(config, ScriptedApi::new());
    queue.send("1", OutboundMessage::text("a")).unwrap();
    queue.send("1", OutboundMessage::text("b")).unwrap();
    assert_eq!(
        queue.send("1", OutboundMessage::text("c")),
        Err(EnqueueError::Full(2))
    );

    let snap = metrics.snapshot();
    assert_eq!(snap.queued, 2);
    assert_eq!(snap.errors_of(ErrorKind::QueueFull), 1);
}

#[tokio::test(start_paused = true)]
async fn pacing_state_only_tracks_recent_conversations() {
    let (queue, worker, _, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    queue.send("1", OutboundMessage::text("a")).unwrap();
    worker.drain().await;
    tokio::time::advance(ms(400)).await;
    queue.send("2", OutboundMessage::text("b")).unwrap();
    worker.drain().await;
    assert_eq!(queue.status().conversations, 1);
}

#[tokio::test(start_paused = true)]
async fn worker_wakes_up_for_messages_sent_while_idle() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));

    tokio::time::sleep(ms(10)).await;
    queue.send("1", OutboundMessage::text("late")).unwrap();
    tokio::time::sleep(ms(10)).await;
    assert_eq!(texts(&api.delivered()), ["late"]);
    assert!(!queue.status().processing);

    tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_within_the_grace_period() {
    let (queue, worker, api, _) = setup(OutboundConfig::default(), ScriptedApi::new());
    for text in ["a", "b", "c"] {
        queue.send("100", OutboundMessage::text(text)).unwrap();
    }
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(texts(&api.delivered()), ["a", "b", "c"]);
    assert_eq!(queue.status().queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_messages_queued_once_the_grace_period_ends() {
    let config = OutboundConfig {
        shutdown_grace_ms: 100,
        ..OutboundConfig::default()
    };
    let (queue, worker, api, _) = setup(config, ScriptedApi::new());
    for text in ["a", "b", "c"] {
        queue.send("100", OutboundMessage::text(text)).unwrap();
    }
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(texts(&api.delivered()), ["a"]);
    assert_eq!(queue.status().queue_length, 2);
}

#[tokio::test(start_paused = true)]
async fn send_cut_short_by_shutdown_is_put_back() {
    let config = OutboundConfig {
        shutdown_grace_ms: 100,
        ..OutboundConfig::default()
    };
    let api = ScriptedApi::new().with_send_latency(Duration::from_secs(1));
    let (queue, worker, api, _) = setup(config, api);
    queue.send("100", OutboundMessage::text("slow")).unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    tokio::time::sleep(ms(10)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(api.attempts().is_empty());
    assert_eq!(queue.status().queue_length, 1);
}

fn retry_after_10s() -> SendError {
    SendError::from_code(
        429,
        "Too Many Requests: retry after 10",
        Some(Duration::from_secs(10)),
    )
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_still_honours_retry_after() {
    let config = OutboundConfig {
        shutdown_grace_ms: 15_000,
        ..OutboundConfig::default()
    };
    let api = ScriptedApi::new();
    api.script_sends([Err(retry_after_10s())]);
    let (queue, worker, api, _) = setup(config, api);
    queue.send("100", OutboundMessage::text("x")).unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    tokio::time::sleep(ms(10)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    let attempts = api.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].ok && attempts[1].ok);
    let gap = attempts[1].at.duration_since(attempts[0].at);
    assert!(gap >= Duration::from_secs(10), "retried after {:?}", gap);
    assert_eq!(queue.status().queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_longer_than_the_grace_period_leaves_the_message_queued() {
    let api = ScriptedApi::new();
    api.script_sends([Err(retry_after_10s()), Err(retry_after_10s())]);
    let (queue, worker, api, _) = setup(OutboundConfig::default(), api);
    queue.send("100", OutboundMessage::text("x")).unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    tokio::time::sleep(ms(10)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(api.attempts().len(), 1);
    assert_eq!(queue.status().queue_length, 1);
}
