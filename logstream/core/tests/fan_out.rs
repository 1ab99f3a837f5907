//! Fan-out, concurrency bound and dynamic membership

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{pod_registry, wait_until, ChannelResolver, Harness, Recorder, ScriptedOpener};
use logstream_core::{
    Handler, HandlerRegistry, SessionOptions, Source, SourceEvent, StreamEventKind,
    ENABLED_SOURCES_PARAM,
};

#[tokio::test]
async fn test_concurrency_bound_per_session() {
    let recorder = Recorder::holding();
    let containers: Vec<String> = (0..25).map(|i| format!("c{i}")).collect();
    let names: Vec<&str> = containers.iter().map(String::as_str).collect();
    let harness = Harness::new(pod_registry(&recorder, &names));

    let session = harness.manager.create_session(
        "pod",
        "big-pod",
        serde_json::Value::Null,
        SessionOptions::follow(),
    );

    let r = Arc::clone(&recorder);
    wait_until(move || r.open_count() == 20).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.open_count(), 20);
    assert_eq!(recorder.live(), 20);
    assert_eq!(recorder.peak(), 20);

    let snapshot = harness.manager.get_session(&session.id).unwrap();
    assert_eq!(snapshot.active_sources.len(), 25);

    // Disabling one running source frees a slot for a waiting one
    let running = names
        .iter()
        .copied()
        .find(|name| recorder.opens_for(name).len() == 1)
        .unwrap();
    let keep = names
        .iter()
        .filter(|name| **name != running)
        .copied()
        .collect::<Vec<_>>()
        .join(",");
    let options = SessionOptions::follow().with_param(ENABLED_SOURCES_PARAM, keep);
    harness
        .manager
        .update_session_options(&session.id, options)
        .unwrap();

    let r = Arc::clone(&recorder);
    wait_until(move || r.open_count() == 21).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.open_count(), 21);
    assert_eq!(recorder.live(), 20);
    assert!(recorder.peak() <= 20);

    harness.manager.close_session(&session.id).await.unwrap();
    assert_eq!(recorder.live(), 0);
}

#[tokio::test]
async fn test_enabled_sources_update_cancels_only_disabled() {
    let recorder = Recorder::holding();
    let mut harness = Harness::new(pod_registry(&recorder, &["app", "sidecar"]));

    let session = harness.manager.create_session(
        "pod",
        "web-0",
        serde_json::Value::Null,
        SessionOptions::follow(),
    );
    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 2).await;

    let updated = harness
        .manager
        .update_session_options(
            &session.id,
            SessionOptions::follow().with_param(ENABLED_SOURCES_PARAM, "app"),
        )
        .unwrap();
    assert_eq!(updated.active_source_ids(), vec!["app"]);

    let out = harness.next().await;
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::SourceRemoved);
    assert_eq!(event.source_id.as_deref(), Some("sidecar"));

    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 1).await;
    harness.assert_quiet(Duration::from_millis(200)).await;
    assert_eq!(recorder.opens_for("app").len(), 1);

    // Enabling everything again restarts sidecar alone
    harness
        .manager
        .update_session_options(
            &session.id,
            SessionOptions::follow().with_param(ENABLED_SOURCES_PARAM, ""),
        )
        .unwrap();

    let out = harness.next().await;
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::SourceAdded);
    assert_eq!(event.source_id.as_deref(), Some("sidecar"));

    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 2).await;
    assert_eq!(recorder.opens_for("app").len(), 1);
    assert_eq!(recorder.opens_for("sidecar").len(), 2);
}

#[tokio::test]
async fn test_enabled_sources_applies_at_fan_out() {
    let recorder = Recorder::holding();
    let harness = Harness::new(pod_registry(&recorder, &["app", "sidecar", "init"]));

    let options = SessionOptions::follow().with_param(ENABLED_SOURCES_PARAM, "app, init");
    let session =
        harness
            .manager
            .create_session("pod", "web-0", serde_json::Value::Null, options);

    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 2).await;
    assert!(recorder.opens_for("sidecar").is_empty());

    let snapshot = harness.manager.get_session(&session.id).unwrap();
    let mut ids = snapshot.active_source_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec!["app", "init"]);
}

#[tokio::test]
async fn test_no_enabled_source_ends_session() {
    let recorder = Recorder::holding();
    let mut harness = Harness::new(pod_registry(&recorder, &["app", "sidecar"]));

    let options = SessionOptions::default().with_param(ENABLED_SOURCES_PARAM, "db");
    let session =
        harness
            .manager
            .create_session("pod", "web-0", serde_json::Value::Null, options);

    let out = harness.next().await;
    assert_eq!(out.session_id, session.id);
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::StreamEnded);
    assert_eq!(event.source_id, None);

    harness.assert_quiet(Duration::from_millis(100)).await;
    assert_eq!(recorder.open_count(), 0);
    let snapshot = harness.manager.get_session(&session.id).unwrap();
    assert!(snapshot.active_sources.is_empty());
}

#[tokio::test]
async fn test_resolver_membership_events() {
    let recorder = Recorder::holding();
    let (resolver, events) = ChannelResolver::new(vec![Source::new("pod-a")]);
    let registry = HandlerRegistry::builder()
        .handler("pod", Handler::new(ScriptedOpener(Arc::clone(&recorder))))
        .resolver("deployment", resolver, "pod")
        .build()
        .unwrap();
    let mut harness = Harness::new(registry);

    let session = harness.manager.create_session(
        "deployment",
        "web",
        serde_json::Value::Null,
        SessionOptions::follow(),
    );
    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 1).await;

    events
        .send(SourceEvent::Added(Source::new("pod-b")))
        .await
        .unwrap();
    let out = harness.next().await;
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::SourceAdded);
    assert_eq!(event.source_id.as_deref(), Some("pod-b"));

    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 2).await;

    events
        .send(SourceEvent::Removed(Source::new("pod-a")))
        .await
        .unwrap();
    let out = harness.next().await;
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::SourceRemoved);
    assert_eq!(event.source_id.as_deref(), Some("pod-a"));

    // The departed source drains naturally rather than being cut off
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.live(), 2);
    let snapshot = harness.manager.get_session(&session.id).unwrap();
    assert_eq!(snapshot.active_source_ids(), vec!["pod-b"]);

    harness.manager.close_session(&session.id).await.unwrap();
    assert_eq!(recorder.live(), 0);
}

#[tokio::test]
async fn test_readded_source_is_announced_while_draining() {
    let recorder = Recorder::holding();
    let (resolver, events) = ChannelResolver::new(vec![Source::new("pod-a")]);
    let registry = HandlerRegistry::builder()
        .handler("pod", Handler::new(ScriptedOpener(Arc::clone(&recorder))))
        .resolver("deployment", resolver, "pod")
        .build()
        .unwrap();
    let mut harness = Harness::new(registry);

    let session = harness.manager.create_session(
        "deployment",
        "web",
        serde_json::Value::Null,
        SessionOptions::follow(),
    );
    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 1).await;

    events
        .send(SourceEvent::Removed(Source::new("pod-a")))
        .await
        .unwrap();
    let out = harness.next().await;
    assert_eq!(
        out.as_event().map(|e| e.kind),
        Some(StreamEventKind::SourceRemoved)
    );

    // The old reader is still draining when the source comes back
    events
        .send(SourceEvent::Added(Source::new("pod-a")))
        .await
        .unwrap();
    let out = harness.next().await;
    let event = out.as_event().unwrap();
    assert_eq!(event.kind, StreamEventKind::SourceAdded);
    assert_eq!(event.source_id.as_deref(), Some("pod-a"));

    harness.assert_quiet(Duration::from_millis(100)).await;
    assert_eq!(recorder.opens_for("pod-a").len(), 1);
    assert_eq!(recorder.live(), 1);
    let snapshot = harness.manager.get_session(&session.id).unwrap();
    assert_eq!(snapshot.active_source_ids(), vec!["pod-a"]);
}

#[tokio::test]
async fn test_source_events_can_be_suppressed() {
    let recorder = Recorder::holding();
    let mut harness = Harness::new(pod_registry(&recorder, &["app", "sidecar"]));

    let options = SessionOptions {
        include_source_events: false,
        ..SessionOptions::follow()
    };
    let session =
        harness
            .manager
            .create_session("pod", "web-0", serde_json::Value::Null, options.clone());
    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 2).await;

    harness
        .manager
        .update_session_options(&session.id, options.with_param(ENABLED_SOURCES_PARAM, "app"))
        .unwrap();

    let r = Arc::clone(&recorder);
    wait_until(move || r.live() == 1).await;
    harness.assert_quiet(Duration::from_millis(200)).await;
}
