//! Run-loop scenarios against the stub broker.

mod support;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use databus_client::{Channel, Error, RunOptions};
use serde_json::{json, Value};
use support::{record_page, StubBroker};

fn channel_for(broker: &StubBroker) -> Channel {
    Channel::new(broker.config().build().expect("config")).expect("channel")
}

fn fast_options(topic: &str) -> RunOptions {
    RunOptions::new()
        .topic(topic)
        .wait_between_queries(Duration::from_millis(10))
}

#[tokio::test]
async fn happy_consume_cycle_delivers_then_commits() {
    let broker = StubBroker::start().await;
    broker.push_records_page(record_page("case-events", 0, 0, &json!({"m": 1})));
    let mut channel = channel_for(&broker);

    let batches: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    channel
        .run(
            move |records| {
                let sink = Arc::clone(&sink);
                async move {
                    let payloads: Vec<Value> =
                        records.iter().map(|r| r.payload.clone()).collect();
                    let mut sink = sink.lock().unwrap();
                    sink.push(payloads);
                    Ok(sink.len() < 2)
                }
            },
            fast_options("case-events"),
        )
        .await
        .unwrap();

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], vec![json!({"m": 1})]);
    assert!(batches[1].is_empty());
    assert_eq!(channel.pending_commits(), 0);

    let state = broker.state();
    assert_eq!(state.consumers_created, 1);
    assert_eq!(state.subscribe_calls, 1);
    // Only the non-empty batch produced a commit.
    assert_eq!(state.commit_calls, 1);
    assert_eq!(
        state.commits[0].1,
        json!({"offsets": [{"topic": "case-events", "partition": 0, "offset": 0}]})
    );
}

#[tokio::test]
async fn consumer_loss_during_consume_recreates_and_resubscribes() {
    let broker = StubBroker::start().await;
    broker.fail_next_records(404);
    broker.push_records_page(record_page("case-events", 0, 0, &json!({"n": 2})));
    let mut channel = channel_for(&broker);

    let delivered: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    channel
        .run(
            move |records| {
                let sink = Arc::clone(&sink);
                async move {
                    let mut sink = sink.lock().unwrap();
                    sink.extend(records.iter().map(|r| r.payload.clone()));
                    // Stop once the batch after recovery has arrived.
                    Ok(sink.is_empty())
                }
            },
            fast_options("case-events"),
        )
        .await
        .unwrap();

    assert_eq!(*delivered.lock().unwrap(), vec![json!({"n": 2})]);
    assert_eq!(channel.consumer_id(), Some("c2"));
    assert_eq!(channel.stats().consumer_resets, 1);

    let state = broker.state();
    assert_eq!(state.consumers_created, 2);
    assert_eq!(state.subscribe_calls, 2);
    assert_eq!(state.subscriptions[1].0, "c2");
    // Every commit that reached the broker belongs to the new consumer.
    assert!(state.commits.iter().all(|(id, _)| id == "c2"));
}

#[tokio::test]
async fn uncommitted_offsets_are_discarded_on_consumer_loss() {
    let broker = StubBroker::start().await;
    broker.push_records_page(record_page("case-events", 0, 0, &json!({"seq": 1})));
    broker.push_records_page(record_page("case-events", 0, 1, &json!({"seq": 2})));
    broker.fail_next_commit(404);
    let mut channel = channel_for(&broker);

    let seen = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&seen);
    channel
        .run(
            move |records| {
                let counter = Arc::clone(&counter);
                async move {
                    let mut seen = counter.lock().unwrap();
                    *seen += records.len() as u32;
                    Ok(*seen < 2)
                }
            },
            fast_options("case-events"),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), 2);

    let state = broker.state();
    // First commit attempt hit 404; the offsets it carried were dropped
    // with the lost consumer and never replayed against the new one.
    assert_eq!(state.commit_calls, 2);
    assert_eq!(state.commits.len(), 1);
    assert_eq!(state.commits[0].0, "c2");
    assert_eq!(
        state.commits[0].1,
        json!({"offsets": [{"topic": "case-events", "partition": 0, "offset": 1}]})
    );
}

#[tokio::test]
async fn stop_during_wait_halts_promptly_with_clean_result() {
    let broker = StubBroker::start().await;
    let mut channel = channel_for(&broker);
    let handle = channel.stop_handle();

    let run = tokio::spawn(async move {
        let result = channel
            .run(
                |_records| async { Ok(true) },
                RunOptions::new()
                    .topic("case-events")
                    .wait_between_queries(Duration::from_secs(5)),
            )
            .await;
        (channel, result)
    });

    // Let the loop reach the between-queries wait.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.is_running());

    let started = Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!handle.is_running());

    let (channel, result) = run.await.unwrap();
    result.unwrap();
    assert!(channel.is_active());

    // A second stop with no loop running returns immediately.
    let started = Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn every_stop_waiter_is_released() {
    let broker = StubBroker::start().await;
    let mut channel = channel_for(&broker);
    let handle_a = channel.stop_handle();
    let handle_b = channel.stop_handle();

    let run = tokio::spawn(async move {
        channel
            .run(
                |_records| async { Ok(true) },
                RunOptions::new()
                    .topic("case-events")
                    .wait_between_queries(Duration::from_secs(5)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopper_a = tokio::spawn(async move { handle_a.stop().await });
    let stopper_b = tokio::spawn(async move { handle_b.stop().await });

    tokio::time::timeout(Duration::from_secs(2), async {
        stopper_a.await.unwrap();
        stopper_b.await.unwrap();
    })
    .await
    .expect("all stop waiters must resolve");

    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn subscription_is_reused_across_cycles() {
    let broker = StubBroker::start().await;
    broker.push_records_page(record_page("case-events", 0, 0, &json!({"seq": 1})));
    broker.push_records_page(record_page("case-events", 0, 1, &json!({"seq": 2})));
    let mut channel = channel_for(&broker);

    let seen = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&seen);
    channel
        .run(
            move |records| {
                let counter = Arc::clone(&counter);
                async move {
                    let mut seen = counter.lock().unwrap();
                    *seen += records.len() as u32;
                    Ok(*seen < 2)
                }
            },
            fast_options("case-events"),
        )
        .await
        .unwrap();

    let state = broker.state();
    assert_eq!(state.consumers_created, 1);
    assert_eq!(state.subscribe_calls, 1);
    assert!(state.records_calls >= 2);
}

#[tokio::test]
async fn process_errors_are_non_recoverable() {
    let broker = StubBroker::start().await;
    let mut channel = channel_for(&broker);
    let handle = channel.stop_handle();

    let err = channel
        .run(
            |_records| async { Err(Error::Permanent("process blew up".to_string())) },
            fast_options("case-events"),
        )
        .await
        .unwrap_err();

    assert!(err.is_permanent());
    assert!(!handle.is_running());
    // The loop failed before any commit happened.
    assert_eq!(broker.state().commit_calls, 0);
}

#[tokio::test]
async fn run_can_reuse_an_existing_subscription() {
    let broker = StubBroker::start().await;
    broker.push_records_page(record_page("case-events", 0, 0, &json!({"m": 1})));
    let mut channel = channel_for(&broker);

    channel.subscribe(vec!["case-events"]).await.unwrap();
    channel
        .run(
            |records| async move { Ok(records.is_empty()) },
            RunOptions::new().wait_between_queries(Duration::from_millis(10)),
        )
        .await
        .unwrap();

    // The run entered through the existing subscription: no second
    // subscribe call was made.
    let state = broker.state();
    assert_eq!(state.subscribe_calls, 1);
}
