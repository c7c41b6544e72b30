//! Control service contract: before-init behavior, the init-once rule, and
//! shutdown/stop-callback semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use opentmux_core::control::{Request, Response, Service};

fn child_event() -> Request {
    Request::SessionCreated {
        event_type: "session.created".to_string(),
        id: "ses_1".to_string(),
        parent_id: "ses_p".to_string(),
        title: "t".to_string(),
    }
}

fn init_request(directory: &str) -> Request {
    Request::Init {
        directory: directory.to_string(),
        server_url: "http://localhost:4096".to_string(),
        config: None,
    }
}

#[tokio::test]
async fn session_events_before_init_are_rejected() {
    let service = Service::new(None);
    match service.handle(child_event()).await {
        Response::SessionCreated { accepted } => assert!(!accepted),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn stats_before_init_read_zero() {
    let service = Service::new(None);
    match service.handle(Request::Stats).await {
        Response::Stats {
            tracked_sessions,
            pending_sessions,
            queue_depth,
        } => {
            assert_eq!(tracked_sessions, 0);
            assert_eq!(pending_sessions, 0);
            assert_eq!(queue_depth, 0);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn init_stats_shutdown_lifecycle() {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<String>();
    let service = Service::new(Some(Arc::new(move |reason| {
        let _ = stopped_tx.send(reason);
    })));

    let dir = tempfile::tempdir().unwrap();
    match service.handle(init_request(&dir.path().to_string_lossy())).await {
        Response::Init { message, .. } => assert_eq!(message, "initialized"),
        other => panic!("unexpected response: {other:?}"),
    }

    match service.handle(Request::Stats).await {
        Response::Stats {
            tracked_sessions,
            pending_sessions,
            ..
        } => {
            assert_eq!(tracked_sessions, 0);
            assert_eq!(pending_sessions, 0);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match service
        .handle(Request::Shutdown {
            reason: "test".to_string(),
        })
        .await
    {
        Response::Shutdown { ok } => assert!(ok),
        other => panic!("unexpected response: {other:?}"),
    }

    let reason = tokio::time::timeout(Duration::from_millis(500), stopped_rx.recv())
        .await
        .expect("stop callback fired")
        .expect("channel open");
    assert_eq!(reason, "test");
}

#[tokio::test]
async fn second_init_is_an_error() {
    let service = Service::new(None);
    let dir = tempfile::tempdir().unwrap();
    let dir_arg = dir.path().to_string_lossy().to_string();

    assert!(matches!(
        service.handle(init_request(&dir_arg)).await,
        Response::Init { .. }
    ));
    match service.handle(init_request(&dir_arg)).await {
        Response::Error { message } => assert!(message.contains("already initialized")),
        other => panic!("unexpected response: {other:?}"),
    }

    let _ = service
        .handle(Request::Shutdown {
            reason: "cleanup".to_string(),
        })
        .await;
}

#[tokio::test]
async fn stop_callback_fires_on_every_shutdown_request() {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<String>();
    let service = Service::new(Some(Arc::new(move |reason| {
        let _ = stopped_tx.send(reason);
    })));

    for reason in ["1", "2"] {
        let response = service
            .handle(Request::Shutdown {
                reason: reason.to_string(),
            })
            .await;
        assert!(matches!(response, Response::Shutdown { ok: true }));
    }

    // callbacks are spawned, so arrival order is not guaranteed
    let mut reasons = Vec::new();
    for _ in 0..2 {
        let reason = tokio::time::timeout(Duration::from_millis(500), stopped_rx.recv())
            .await
            .expect("stop callback fired")
            .expect("channel open");
        reasons.push(reason);
    }
    reasons.sort();
    assert_eq!(reasons, vec!["1".to_string(), "2".to_string()]);
}

#[tokio::test]
async fn config_file_in_directory_drives_init_enabled_flag() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("opentmux.json"), r#"{"enabled":false}"#).unwrap();

    let service = Service::new(None);
    match service
        .handle(init_request(&dir.path().to_string_lossy()))
        .await
    {
        Response::Init { enabled, .. } => assert!(!enabled),
        other => panic!("unexpected response: {other:?}"),
    }
}
