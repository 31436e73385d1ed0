use std::sync::Arc;
use std::time::Duration;

use mailweave::{
    AcknowledgmentResponder, IngestPipeline, MailTransport, MemoryTransport, PollTask, Poller,
    RawMessage, ReplyService, RetryPolicy, ThreadStore,
};

const BOT: &str = "bot@example.com";

fn mail(id: &str, from: &str, to: &str, subject: &str, extra: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: {to}\r\nMessage-ID: <{id}>\r\nSubject: {subject}\r\n\
         Date: Wed, 2 Jul 2003 09:00:00 +0000\r\n{extra}\r\nHello from {from}\r\n"
    )
    .into_bytes()
}

fn fast() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(2),
        max_attempts: 5,
    }
}

#[tokio::test]
async fn batch_with_unparseable_message_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ThreadStore::open(dir.path().join("mail.db")).unwrap());
    let transport = Arc::new(MemoryTransport::new());
    let pipeline = IngestPipeline::new(store.clone(), transport.clone(), BOT);

    transport
        .deliver(RawMessage::new(1, mail("one@x", "alice@example.com", BOT, "One", "")))
        .await;
    transport
        .deliver(RawMessage::new(2, b"To: bot@example.com\r\nSubject: broken\r\n\r\n?".to_vec()))
        .await;
    transport
        .deliver(RawMessage::new(3, mail("three@x", "carol@example.com", BOT, "Three", "")))
        .await;

    let report = pipeline.run_tick().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.persisted, 2);
    assert_eq!(report.parse_failures, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(store.thread_messages("One_alice@example.com").unwrap().len(), 1);
    assert_eq!(store.thread_messages("Three_carol@example.com").unwrap().len(), 1);
    assert!(transport.fetch_unseen().await.unwrap().is_empty());

    // a second tick over the same mailbox finds nothing left to do
    let report = pipeline.run_tick().await.unwrap();
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn refetched_message_is_stored_once() {
    let store = Arc::new(ThreadStore::in_memory().unwrap());
    let transport = Arc::new(MemoryTransport::new());
    let pipeline = IngestPipeline::new(store.clone(), transport.clone(), BOT);

    let raw = RawMessage::new(1, mail("dup@x", "alice@example.com", BOT, "Hi", ""));
    pipeline.process_raw(&raw).await.unwrap();

    // same bytes under a new UID, as after a server-side move
    transport.deliver(RawMessage::new(9, raw.bytes.clone())).await;
    let report = pipeline.run_tick().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.persisted, 0);
    assert_eq!(store.thread_messages("Hi_alice@example.com").unwrap().len(), 1);
}

#[tokio::test]
async fn poller_acknowledges_and_threads_the_reply() {
    let store = Arc::new(ThreadStore::in_memory().unwrap());
    let transport = Arc::new(MemoryTransport::new());

    let replies = Arc::new(
        ReplyService::new(store.clone(), transport.clone(), BOT).with_retry_policy(fast()),
    );
    let mut pipeline = IngestPipeline::new(store.clone(), transport.clone(), BOT);
    pipeline.register_callback(Arc::new(AcknowledgmentResponder::new(replies, "-- bot")));
    let pipeline = Arc::new(pipeline);

    transport
        .deliver(RawMessage::new(
            1,
            mail(
                "q@x",
                "Alice <alice@example.com>",
                "bot@example.com, carol@example.com",
                "Question",
                "References: <root@x>\r\n",
            ),
        ))
        .await;

    let poller = Poller::new(pipeline.clone() as Arc<dyn PollTask>, Duration::from_millis(5));
    poller.start().await;
    for _ in 0..500 {
        if !transport.seen().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    poller.stop().await;

    assert_eq!(transport.seen().await, vec![1]);

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["alice@example.com", "carol@example.com"]);
    assert_eq!(sent[0].subject, "Re: Question");
    assert_eq!(sent[0].references.as_deref(), Some("<root@x> <q@x>"));

    let messages = store.thread_messages("root@x").unwrap();
    assert_eq!(messages.len(), 2);
    assert!(!messages.iter().all(|m| m.is_sent_by_system));
    assert!(messages.iter().any(|m| m.is_sent_by_system && m.sender == BOT));

    let thread = store.recent_threads(1).unwrap().remove(0);
    assert_eq!(
        thread.participants.into_iter().collect::<Vec<_>>(),
        vec!["alice@example.com", "bot@example.com", "carol@example.com"]
    );
}

#[tokio::test]
async fn own_messages_never_trigger_replies() {
    let store = Arc::new(ThreadStore::in_memory().unwrap());
    let transport = Arc::new(MemoryTransport::new());

    let replies = Arc::new(
        ReplyService::new(store.clone(), transport.clone(), BOT).with_retry_policy(fast()),
    );
    let mut pipeline = IngestPipeline::new(store.clone(), transport.clone(), BOT);
    pipeline.register_callback(Arc::new(AcknowledgmentResponder::new(replies, "-- bot")));

    transport
        .deliver(RawMessage::new(4, mail("echo@x", "BOT@example.com", "alice@example.com", "Re: Hi", "")))
        .await;

    let report = pipeline.run_tick().await.unwrap();
    assert_eq!(report.filtered, 1);
    assert!(transport.sent().await.is_empty());
    assert!(store.recent_threads(10).unwrap().is_empty());
    assert_eq!(transport.seen().await, vec![4]);
}
