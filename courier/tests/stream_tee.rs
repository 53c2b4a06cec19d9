//! Tee semantics: observers see every event, even when the platform push
//! fails; SSE framing for observed streams.

mod init_logging;

use std::sync::Arc;

use courier::adapter::mock::MockAdapter;
use courier::{
    ChannelConfig, ChannelError, ChannelType, Message, RecordingObserver, SseLineObserver,
    StreamOptions, StreamReplySender, Target,
};
use tokio::sync::mpsc;

fn sender(adapter: Arc<MockAdapter>, observer: Arc<RecordingObserver>) -> StreamReplySender {
    let config = Arc::new(ChannelConfig::new("cfg-1", "bot-1", ChannelType::new("mock")));
    StreamReplySender::new(adapter, config, Some(observer))
}

#[tokio::test]
async fn observer_sees_events_despite_primary_failure() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender().with_stream_sender());
    adapter.fail_stream_pushes();
    let observer = Arc::new(RecordingObserver::new());
    let reply_sender = sender(Arc::clone(&adapter), Arc::clone(&observer));

    let mut session = reply_sender
        .open_stream("sess-1", &Target::new("t1"), StreamOptions::default())
        .await
        .unwrap();

    // Primary push fails (rate-limited platform)...
    let err = session.start().await.unwrap_err();
    assert!(matches!(err, ChannelError::Transport(_)));
    // ...but monitoring stays truthful.
    assert_eq!(observer.kinds("sess-1"), vec!["started"]);
    // The adapter stream recorded the attempt too.
    assert_eq!(adapter.streams().len(), 1);
    assert_eq!(adapter.streams()[0].lock().unwrap().len(), 1);
}

#[tokio::test]
async fn close_does_not_notify_observers() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender().with_stream_sender());
    let observer = Arc::new(RecordingObserver::new());
    let reply_sender = sender(Arc::clone(&adapter), Arc::clone(&observer));

    let mut session = reply_sender
        .open_stream("sess-2", &Target::new("t1"), StreamOptions::default())
        .await
        .unwrap();
    session.start().await.unwrap();
    session.close().await.unwrap();

    // Only the started event; close is invisible to observers.
    assert_eq!(observer.kinds("sess-2"), vec!["started"]);
}

#[tokio::test]
async fn full_session_event_order_over_stream() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender().with_stream_sender());
    let observer = Arc::new(RecordingObserver::new());
    let reply_sender = sender(Arc::clone(&adapter), Arc::clone(&observer));

    let mut session = reply_sender
        .open_stream("sess-3", &Target::new("t1"), StreamOptions::default())
        .await
        .unwrap();
    session.start().await.unwrap();
    session.push_tool_call_start("search").await.unwrap();
    session.push_tool_call_end("search").await.unwrap();
    session.push_delta("partial", None).await.unwrap();
    session.push_final(Message::text("done")).await.unwrap();
    session.complete().await.unwrap();

    assert_eq!(
        observer.kinds("sess-3"),
        vec![
            "started",
            "tool_call_start",
            "tool_call_end",
            "delta",
            "final",
            "completed"
        ]
    );
}

#[tokio::test]
async fn sse_lines_sequence_and_terminate() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender());
    let (tx, mut rx) = mpsc::channel(16);
    let observer = Arc::new(SseLineObserver::new(tx));
    let config = Arc::new(ChannelConfig::new("cfg-1", "bot-1", ChannelType::new("mock")));
    let reply_sender = StreamReplySender::new(Arc::clone(&adapter) as _, config, Some(observer as _));

    let mut session = reply_sender
        .open_stream("sess-sse", &Target::new("t1"), StreamOptions::default())
        .await
        .unwrap();
    session.start().await.unwrap();
    session.push_delta("hi", None).await.unwrap();
    session.push_final(Message::text("hi")).await.unwrap();
    session.complete().await.unwrap();

    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|l| l.starts_with("data: ") && l.ends_with("\n\n")));
    assert!(lines[0].contains("\"started\""));
    assert!(lines[3].contains("\"completed\""));
    for (i, line) in lines.iter().enumerate() {
        assert!(line.contains(&format!("\"event_id\":{}", i + 1)));
    }
}
