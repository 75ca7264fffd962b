//! Integration tests for publish/subscribe listeners.

use relaybus::{CoordinationClient, Error, WorkerState};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Option<Duration> = Some(Duration::from_millis(10));

/// Publish until at least `expected` subscribers are counted. Listener
/// registration with the store completes before start returns, but this
/// keeps the tests independent of that ordering.
async fn publish_to(client: &CoordinationClient, channel: &str, payload: &[u8], expected: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if client.publish(channel, payload).await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber never registered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_receives_published_payload() {
    let client = CoordinationClient::in_memory();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .start_subscribe_listener(
            "C",
            move |payload| {
                tx.send(payload)?;
                Ok(())
            },
            POLL,
        )
        .await
        .unwrap();

    assert_eq!(client.publish("C", b"x").await.unwrap(), 1);
    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, b"x");

    client.stop_subscribe_listener("C").await.unwrap();
    tokio::time::timeout(WAIT, handle.join())
        .await
        .unwrap()
        .unwrap();

    // Unsubscribed: nobody counts, and the handler (and its sender) are gone.
    assert_eq!(client.publish("C", b"y").await.unwrap(), 0);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn publish_without_subscribers_returns_zero() {
    let client = CoordinationClient::in_memory();
    let count = tokio::time::timeout(WAIT, client.publish("nobody-listens", b"x"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_exits_within_a_poll_interval_without_traffic() {
    let client = CoordinationClient::in_memory();
    let handle = client
        .start_subscribe_listener("quiet", |_| Ok(()), POLL)
        .await
        .unwrap();

    client.stop_subscribe_listener("quiet").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .expect("listener should notice the stop on its next poll")
        .unwrap();
}

#[tokio::test]
async fn stopping_unknown_or_stopped_listener_is_not_found() {
    let client = CoordinationClient::in_memory();
    assert!(matches!(
        client.stop_subscribe_listener("C").await,
        Err(Error::NotFound(_))
    ));

    let _handle = client
        .start_subscribe_listener("C", |_| Ok(()), POLL)
        .await
        .unwrap();
    client.stop_subscribe_listener("C").await.unwrap();
    assert!(matches!(
        client.stop_subscribe_listener("C").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        client.stop_psubscribe_listener("C").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_topic_is_rejected_but_channel_and_pattern_coexist() {
    let client = CoordinationClient::in_memory();
    let _channel = client
        .start_subscribe_listener("params", |_| Ok(()), POLL)
        .await
        .unwrap();

    let again = client
        .start_subscribe_listener("params", |_| Ok(()), POLL)
        .await;
    assert!(matches!(again, Err(Error::DuplicateListener(ref t)) if t == "channel:params"));

    let _pattern = client
        .start_psubscribe_listener("params", |_, _| Ok(()), POLL)
        .await
        .unwrap();

    let names: Vec<String> = client
        .subscribe_listeners()
        .await
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["channel:params", "pattern:params"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pattern_listener_sees_matching_channels_only() {
    let client = CoordinationClient::in_memory();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = client
        .start_psubscribe_listener(
            "params.*",
            move |channel, payload| {
                tx.send((channel, String::from_utf8(payload)?))?;
                Ok(())
            },
            POLL,
        )
        .await
        .unwrap();

    assert_eq!(client.publish("experience.0", b"skip").await.unwrap(), 0);
    publish_to(&client, "params.policy", b"v1", 1).await;
    publish_to(&client, "params.value", b"v2", 1).await;

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        got,
        vec![
            ("params.policy".to_string(), "v1".to_string()),
            ("params.value".to_string(), "v2".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_listener_on_a_channel_receives_the_message() {
    let client = CoordinationClient::in_memory();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let by_channel = tx.clone();
    let _exact = client
        .start_subscribe_listener(
            "params.policy",
            move |_| {
                by_channel.send("exact")?;
                Ok(())
            },
            POLL,
        )
        .await
        .unwrap();
    let _glob = client
        .start_psubscribe_listener(
            "params.*",
            move |_, _| {
                tx.send("glob")?;
                Ok(())
            },
            POLL,
        )
        .await
        .unwrap();

    assert_eq!(client.publish("params.policy", b"w").await.unwrap(), 2);
    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    got.sort();
    assert_eq!(got, vec!["exact", "glob"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_handler_error_fails_and_releases_topic() {
    let client = CoordinationClient::in_memory();
    let handle = client
        .start_subscribe_listener("C", |_| Err("bad payload".into()), POLL)
        .await
        .unwrap();
    assert_eq!(handle.state(), WorkerState::Running);

    client.publish("C", b"x").await.unwrap();
    let err = tokio::time::timeout(WAIT, handle.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Handler { ref name, .. } if name == "channel:C"));
    assert!(client.subscribe_listeners().await.is_empty());

    let restarted = client.start_subscribe_listener("C", |_| Ok(()), POLL).await;
    assert!(restarted.is_ok());
}

#[tokio::test]
async fn zero_poll_interval_is_rejected() {
    let client = CoordinationClient::in_memory();
    let result = client
        .start_subscribe_listener("C", |_| Ok(()), Some(Duration::ZERO))
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(client.subscribe_listeners().await.is_empty());
}

#[tokio::test]
async fn invalid_pattern_fails_to_start() {
    let client = CoordinationClient::in_memory();
    let result = client
        .start_psubscribe_listener("params.[", |_, _| Ok(()), POLL)
        .await;
    assert!(result.is_err());
    assert!(client.subscribe_listeners().await.is_empty());
}
