mod harness;

use std::time::Duration;

use conduit_runtime::{CallOptions, ChatRequest, ErrorKind, Message, ModelRuntime, StreamEvent};
use futures_util::StreamExt;
use harness::config;
use harness::mock_upstream::{MockUpstream, Mode};
use tokio_util::sync::CancellationToken;

fn hello() -> ChatRequest {
    ChatRequest::new("gpt-4o-mini", vec![Message::user("Hello")]).streaming()
}

fn terminal_errors(events: &[StreamEvent]) -> Vec<ErrorKind> {
    events
        .iter()
        .filter(|e| e.is_terminal())
        .map(|e| match e {
            StreamEvent::Error(error) => error.kind(),
            StreamEvent::Cancelled => ErrorKind::Cancelled,
            other => panic!("unexpected terminal event {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn stalled_stream_times_out_once() {
    let mock = MockUpstream::builder().mode(Mode::Stall).start().await.unwrap();
    let runtime = config::runtime("openai", &mock.base_url());
    let options = CallOptions::new().with_timeout(Duration::from_millis(300));

    let stream = runtime.chat_completion(&hello(), &options).await.unwrap().into_stream();
    let events: Vec<StreamEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream must end at its deadline");

    assert_eq!(
        events.first(),
        Some(&StreamEvent::TextDelta {
            text: "Hel".to_owned()
        })
    );
    assert_eq!(terminal_errors(&events), vec![ErrorKind::Timeout]);
    assert!(events.last().is_some_and(StreamEvent::is_terminal));
}

#[tokio::test]
async fn cancelling_ends_the_stream_promptly() {
    let mock = MockUpstream::builder().mode(Mode::Stall).start().await.unwrap();
    let runtime = config::runtime("openai", &mock.base_url());
    let cancel = CancellationToken::new();
    let options = CallOptions::new().with_cancel(cancel.clone());

    let mut stream = runtime.chat_completion(&hello(), &options).await.unwrap().into_stream();
    let first = stream.next().await;
    assert!(matches!(first, Some(StreamEvent::TextDelta { .. })));

    assert!(!mock.body_dropped());

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("cancellation must end the stream within a second");
    assert_eq!(next, Some(StreamEvent::Cancelled));

    // The caller still holds the stream; the upstream body must already be gone
    tokio::time::timeout(Duration::from_secs(1), async {
        while !mock.body_dropped() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream connection must close within a second of cancelling");

    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn cancelled_before_connect_sends_nothing_further() {
    let mock = MockUpstream::start().await.unwrap();
    let runtime = config::runtime("openai", &mock.base_url());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events: Vec<StreamEvent> = runtime
        .chat_completion(&hello(), &CallOptions::new().with_cancel(cancel))
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(events, vec![StreamEvent::Cancelled]);
}

#[tokio::test]
async fn mid_stream_overload_follows_delivered_text() {
    let mock = MockUpstream::builder().mode(Mode::Overloaded).start().await.unwrap();
    let runtime = config::runtime("anthropic", &mock.base_url());
    let request = ChatRequest::new("claude-3-5-haiku-20241022", vec![Message::user("Hello")]).streaming();

    let events: Vec<StreamEvent> = runtime
        .chat_completion(&request, &CallOptions::new())
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello there");

    let Some(StreamEvent::Error(error)) = events.last() else {
        panic!("stream must end with an error, got {events:?}");
    };
    assert_eq!(error.kind(), ErrorKind::Transient);
    assert_eq!(error.provider(), Some("anthropic"));
    assert_eq!(terminal_errors(&events).len(), 1);
}

#[tokio::test]
async fn streaming_connect_failure_is_not_retried() {
    let mock = MockUpstream::builder().failing(1, 503).start().await.unwrap();
    let runtime = config::runtime("openai", &mock.base_url());

    let events: Vec<StreamEvent> = runtime
        .chat_completion(&hello(), &CallOptions::new())
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(terminal_errors(&events), vec![ErrorKind::Transient]);
    assert_eq!(events.len(), 1);
    assert_eq!(mock.request_count(), 1);
}
