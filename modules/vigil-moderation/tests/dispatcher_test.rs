use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use classifier_client::ModerationVerdict;
use vigil_common::config::ModerationConfig;
use vigil_common::testing::MemoryStore;
use vigil_common::{BlockRecord, NotificationKind, PendingDisputeItem, RelayEvent, Store};
use vigil_moderation::testing::{allow, block, MockClassifier};
use vigil_moderation::{ModerationDispatcher, NO_MEDIA_EXPLANATION};

fn dispatcher(
    store: &Arc<MemoryStore>,
    classifier: &Arc<MockClassifier>,
) -> Arc<ModerationDispatcher> {
    Arc::new(ModerationDispatcher::new(
        store.clone(),
        classifier.clone(),
        ModerationConfig::default(),
    ))
}

fn media_event(id: &str, urls: &[&str]) -> RelayEvent {
    RelayEvent {
        id: id.to_string(),
        pubkey: "author".to_string(),
        kind: 1,
        created_at: 1_700_000_000,
        tags: urls
            .iter()
            .map(|u| vec!["imeta".to_string(), format!("url {u}")])
            .collect(),
        content: "look at this".to_string(),
    }
}

fn blocked(event_id: &str) -> BlockRecord {
    BlockRecord {
        event_id: event_id.to_string(),
        blocked_at: Utc::now(),
        reason: "explicit".to_string(),
        content_level: 5,
        offending_url: "https://cdn.example/a.jpg".to_string(),
    }
}

fn dispute(event_id: &str) -> PendingDisputeItem {
    PendingDisputeItem {
        dispute_id: format!("d-{event_id}"),
        ticket_id: format!("t-{event_id}"),
        event_id: event_id.to_string(),
        user_pubkey: "disputer".to_string(),
        dispute_reason: "this is classical art".to_string(),
    }
}

#[tokio::test]
async fn concurrent_polls_process_each_item_once() {
    let mut store = MemoryStore::new();
    for i in 0..25 {
        let url = format!("https://cdn.example/{i}.jpg");
        store = store.with_moderation_item(&format!("ev{i}"), &[url.as_str()]);
    }
    let store = Arc::new(store);
    let classifier = Arc::new(MockClassifier::new());
    let d = dispatcher(&store, &classifier);

    let (a, b, c, e) = tokio::join!(d.poll_once(), d.poll_once(), d.poll_once(), d.poll_once());
    let spawned = a.unwrap() + b.unwrap() + c.unwrap() + e.unwrap();
    assert!(spawned <= 25);
    while !store.moderation_queue().is_empty() {
        d.poll_once().await.unwrap();
    }
    d.wait_idle().await;

    let dequeued = store.dequeued_moderation();
    let unique: HashSet<_> = dequeued.iter().collect();
    assert_eq!(dequeued.len(), 25);
    assert_eq!(unique.len(), 25);

    let calls = classifier.calls();
    let unique_calls: HashSet<_> = calls.iter().collect();
    assert_eq!(calls.len(), 25);
    assert_eq!(unique_calls.len(), 25);
}

#[tokio::test(start_paused = true)]
async fn worker_concurrency_is_bounded() {
    let mut store = MemoryStore::new();
    for i in 0..10 {
        let url = format!("https://cdn.example/{i}.jpg");
        store = store.with_moderation_item(&format!("ev{i}"), &[url.as_str()]);
    }
    let store = Arc::new(store);
    let classifier = Arc::new(MockClassifier::new().with_delay(Duration::from_secs(1)));
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    assert_eq!(classifier.calls().len(), 10);
    assert!(classifier.max_in_flight() <= ModerationConfig::default().worker_concurrency);
}

#[tokio::test]
async fn first_block_stops_evaluation() {
    let store = Arc::new(MemoryStore::new().with_moderation_item(
        "ev1",
        &[
            "https://cdn.example/a.jpg",
            "https://cdn.example/b.jpg",
            "https://cdn.example/c.jpg",
        ],
    ));
    let classifier = Arc::new(
        MockClassifier::new().on_url("https://cdn.example/b.jpg", block(5, "explicit nudity")),
    );
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    assert_eq!(
        classifier.calls(),
        vec!["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"]
    );
    let record = store.block("ev1").expect("event should be blocked");
    assert_eq!(record.offending_url, "https://cdn.example/b.jpg");
    assert_eq!(record.reason, "explicit nudity");
    assert_eq!(record.content_level, 5);

    let notes = store.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::ContentBlocked);
    assert_eq!(notes[0].event_id.as_deref(), Some("ev1"));
    assert!(store.moderation_queue().is_empty());
}

#[tokio::test]
async fn block_notification_goes_to_the_author() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &["https://cdn.example/a.jpg"]))
            .with_moderation_item("ev1", &["https://cdn.example/a.jpg"]),
    );
    let classifier = Arc::new(
        MockClassifier::new().on_url("https://cdn.example/a.jpg", block(5, "explicit nudity")),
    );
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    let notes = store.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::ContentBlocked);
    assert_eq!(notes[0].recipient.as_deref(), Some("author"));
}

#[tokio::test]
async fn flag_and_allow_leave_event_visible() {
    use classifier_client::Decision;
    use vigil_moderation::testing::verdict;

    let store = Arc::new(MemoryStore::new().with_moderation_item(
        "ev1",
        &["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"],
    ));
    let classifier = Arc::new(
        MockClassifier::new()
            .on_url("https://cdn.example/a.jpg", verdict(3, Decision::Flag, "suggestive"))
            .on_url("https://cdn.example/b.jpg", verdict(5, Decision::Allow, "verbatim")),
    );
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    assert!(store.blocks().is_empty());
    assert_eq!(classifier.calls().len(), 2);
}

#[tokio::test]
async fn classifier_errors_fail_open() {
    let store = Arc::new(
        MemoryStore::new().with_moderation_item("ev1", &["https://cdn.example/a.jpg"]),
    );
    let classifier = Arc::new(MockClassifier::new().failing("https://cdn.example/a.jpg"));
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    assert!(store.block("ev1").is_none());
    assert!(store.moderation_queue().is_empty());
}

#[tokio::test]
async fn panicking_item_does_not_stop_the_batch() {
    let store = Arc::new(
        MemoryStore::new()
            .with_moderation_item("boom", &["https://cdn.example/boom.jpg"])
            .with_moderation_item("bad", &["https://cdn.example/bad.jpg"]),
    );
    let classifier = Arc::new(
        MockClassifier::new()
            .panicking("https://cdn.example/boom.jpg")
            .on_url("https://cdn.example/bad.jpg", block(4, "graphic violence")),
    );
    let d = dispatcher(&store, &classifier);

    d.poll_once().await.unwrap();
    d.wait_idle().await;

    assert!(store.block("boom").is_none());
    assert!(store.block("bad").is_some());
    assert!(store.moderation_queue().is_empty());
}

#[tokio::test]
async fn already_blocked_items_are_skipped() {
    let store = Arc::new(
        MemoryStore::new()
            .with_block(blocked("ev1"))
            .with_moderation_item("ev1", &["https://cdn.example/a.jpg"]),
    );
    let classifier = Arc::new(MockClassifier::new());
    let d = dispatcher(&store, &classifier);

    assert_eq!(d.poll_once().await.unwrap(), 0);
    d.wait_idle().await;

    assert!(classifier.calls().is_empty());
    assert!(store.moderation_queue().is_empty());
}

#[tokio::test]
async fn dispute_approved_by_second_url() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event(
                "ev1",
                &["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"],
            ))
            .with_block(blocked("ev1"))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(
        MockClassifier::new()
            .on_dispute("https://cdn.example/a.jpg", block(4, "still explicit"))
            .on_dispute("https://cdn.example/b.jpg", allow("artistic context")),
    );
    let d = dispatcher(&store, &classifier);

    assert_eq!(d.resolve_disputes_once().await.unwrap(), 1);

    let resolutions = store.resolutions();
    assert_eq!(resolutions.len(), 1);
    assert!(resolutions[0].approved);
    assert_eq!(resolutions[0].explanation, "artistic context");
    assert!(store.block("ev1").is_none());

    let calls = classifier.dispute_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, "this is classical art");

    let notes = store.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::DisputeResolved);
    assert_eq!(notes[0].recipient.as_deref(), Some("disputer"));
}

#[tokio::test]
async fn dispute_rejected_when_every_url_blocks() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &["https://cdn.example/a.jpg"]))
            .with_block(blocked("ev1"))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(
        MockClassifier::new().on_dispute("https://cdn.example/a.jpg", block(5, "explicit")),
    );
    let d = dispatcher(&store, &classifier);

    d.resolve_disputes_once().await.unwrap();

    let resolutions = store.resolutions();
    assert!(!resolutions[0].approved);
    assert_eq!(resolutions[0].explanation, "explicit");
    assert!(store.block("ev1").is_some());
    assert_eq!(store.notifications().len(), 1);
}

#[tokio::test]
async fn unreachable_dispute_media_keeps_the_block() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &["https://cdn.example/a.jpg"]))
            .with_block(blocked("ev1"))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(MockClassifier::new().on_dispute(
        "https://cdn.example/a.jpg",
        ModerationVerdict::fail_open("Failed to download media: HTTP 500"),
    ));
    let d = dispatcher(&store, &classifier);

    assert_eq!(d.resolve_disputes_once().await.unwrap(), 1);

    let resolutions = store.resolutions();
    assert!(!resolutions[0].approved);
    assert!(resolutions[0].explanation.contains("HTTP 500"));
    let record = store.block("ev1").expect("event should stay blocked");
    assert_eq!(record.content_level, 5);
}

#[tokio::test]
async fn disabled_classifier_cannot_approve_a_dispute() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &["https://cdn.example/a.jpg"]))
            .with_block(blocked("ev1"))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(
        MockClassifier::new().on_dispute("https://cdn.example/a.jpg", ModerationVerdict::disabled()),
    );
    let d = dispatcher(&store, &classifier);

    d.resolve_disputes_once().await.unwrap();

    assert!(!store.resolutions()[0].approved);
    assert!(store.block("ev1").is_some());
}

#[tokio::test]
async fn dispute_without_media_is_rejected() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &[]))
            .with_block(blocked("ev1"))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(MockClassifier::new());
    let d = dispatcher(&store, &classifier);

    d.resolve_disputes_once().await.unwrap();

    let resolutions = store.resolutions();
    assert!(!resolutions[0].approved);
    assert_eq!(resolutions[0].explanation, NO_MEDIA_EXPLANATION);
    assert!(classifier.dispute_calls().is_empty());
}

#[tokio::test]
async fn stale_dispute_is_dropped() {
    let store = Arc::new(
        MemoryStore::new()
            .with_event(media_event("ev1", &["https://cdn.example/a.jpg"]))
            .with_dispute(dispute("ev1")),
    );
    let classifier = Arc::new(MockClassifier::new());
    let d = dispatcher(&store, &classifier);

    assert_eq!(d.resolve_disputes_once().await.unwrap(), 0);
    assert!(store.resolutions().is_empty());
    assert!(store.notifications().is_empty());
    assert!(classifier.dispute_calls().is_empty());
}

#[tokio::test]
async fn purge_removes_blocks_past_retention() {
    let store = Arc::new(
        MemoryStore::new()
            .with_block(BlockRecord {
                blocked_at: Utc::now() - chrono::Duration::hours(48),
                ..blocked("old")
            })
            .with_block(blocked("new")),
    );
    let d = dispatcher(&store, &Arc::new(MockClassifier::new()));

    assert_eq!(d.purge_blocked().await.unwrap(), 1);
    assert!(store.block("new").is_some());
    assert!(!store.is_blocked("old").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn scheduler_drives_polling_until_shutdown() {
    let store = Arc::new(
        MemoryStore::new().with_moderation_item("ev1", &["https://cdn.example/a.jpg"]),
    );
    let classifier = Arc::new(
        MockClassifier::new().on_url("https://cdn.example/a.jpg", block(5, "explicit")),
    );
    let d = dispatcher(&store, &classifier);
    assert_eq!(
        d.scheduler().task_names(),
        vec![
            "moderation-poll",
            "dispute-resolution",
            "temp-cleanup",
            "block-purge",
            "resolution-purge"
        ]
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(d.clone().run(shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(12)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert!(store.block("ev1").is_some());
}
