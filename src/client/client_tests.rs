// Client tests against a live server
use axum::{
    response::sse::{Event as SseEvent, Sse},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::Role;
use crate::api::test_support::TestApp;
use crate::api::types::DuplexMessage;
use crate::client::{ApiClient, DuplexClient, ReconnectPolicy, SseWatcher, WatchEvent};
use crate::engine::channel::{ChannelId, ProgressChannel};
use crate::models::{
    GenerationRequest, ProgressEvent, ReviewAction, ReviewDecision, Run, RunId, RunStatus,
    RunUpdate,
};
use crate::ForgeError;

fn base(app: &TestApp) -> String {
    format!("http://{}", app.addr)
}

async fn publish(app: &TestApp, run_id: &RunId, event: ProgressEvent) {
    app.channel
        .publish(&ChannelId::for_run(run_id), &event)
        .await
        .unwrap();
}

async fn wait_for_subscribers(app: &TestApp, run_id: &RunId, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while app.channel.subscriber_count(&ChannelId::for_run(run_id)) != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count not reached");
}

#[tokio::test]
async fn test_api_client_round_trip() {
    let app = TestApp::spawn().await;
    let client = ApiClient::new(&base(&app), app.token("alice", Role::Editor)).unwrap();

    let created = client
        .create_generation(&GenerationRequest::new("Ownership in practice"))
        .await
        .unwrap();
    assert!(created.queued);
    assert_eq!(created.run.status, RunStatus::Pending);

    let fetched = client.get_generation(&created.run.id).await.unwrap();
    assert_eq!(fetched.id, created.run.id);

    let page = client.list_generations(1, 10).await.unwrap();
    assert_eq!(page.total, 1);

    let accepted = client
        .submit_review(
            &created.run.id,
            "outline_review",
            &ReviewDecision::Reject {
                feedback: "needs examples".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.action, ReviewAction::Reject);

    let err = client
        .get_generation(&RunId::parse("missing").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::NotFound(_)));
}

#[tokio::test]
async fn test_watcher_follows_run_to_completion() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Watch me").await;
    let watcher = SseWatcher::new(&base(&app), app.token("alice", Role::Viewer)).unwrap();

    let mut events = watcher.watch(&run.id).unwrap();
    assert_eq!(events.next().await, Some(WatchEvent::Connected));
    wait_for_subscribers(&app, &run.id, 1).await;

    publish(&app, &run.id, ProgressEvent::stage_started("research")).await;
    publish(
        &app,
        &run.id,
        ProgressEvent::GenerationCompleted {
            result_ref: Some("article-1".into()),
        },
    )
    .await;

    let rest: Vec<WatchEvent> = tokio::time::timeout(Duration::from_secs(5), events.collect())
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert!(matches!(&rest[0], WatchEvent::Progress(ProgressEvent::StageStarted { stage, .. }) if stage == "research"));
    assert!(matches!(
        &rest[1],
        WatchEvent::Progress(ProgressEvent::GenerationCompleted { .. })
    ));
}

#[tokio::test]
async fn test_watcher_ends_on_already_finished_run() {
    let app = TestApp::spawn_with_heartbeat(Duration::from_secs(1)).await;
    let run = app.seed_run("alice", "Finished before anyone looked").await;
    app.finish_run(&run.id, RunUpdate::completed(Some("article-5".into()), 300, 0.04))
        .await;

    let watcher = SseWatcher::new(&base(&app), app.token("alice", Role::Viewer)).unwrap();
    let events: Vec<WatchEvent> =
        tokio::time::timeout(Duration::from_secs(5), watcher.watch(&run.id).unwrap().collect())
            .await
            .expect("watcher kept waiting on a completed run");

    assert_eq!(
        events,
        vec![
            WatchEvent::Connected,
            WatchEvent::Progress(ProgressEvent::GenerationCompleted {
                result_ref: Some("article-5".into())
            }),
        ]
    );
}

/// A stand-in server whose stream drops after the greeting and whose summary says the
/// run already finished
async fn spawn_flaky_server(summary: Run, opens: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route(
            "/api/sse/generation/:run_id",
            get(move || {
                let opens = opens.clone();
                async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                    let greeting = SseEvent::default().event("connected").data("{}");
                    Sse::new(futures::stream::iter(vec![Ok::<_, Infallible>(greeting)]))
                }
            }),
        )
        .route(
            "/api/generations/:run_id",
            get(move || {
                let summary = summary.clone();
                async move { Json(summary) }
            }),
        );

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_watcher_checks_summary_before_reconnecting() {
    let mut run = Run::new(RunId::new(), "alice", GenerationRequest::new("Missed the end"));
    run.apply(&RunUpdate {
        status: Some(RunStatus::Failed),
        error_message: Some("write_sections: quota exceeded".into()),
        ..Default::default()
    });
    let opens = Arc::new(AtomicUsize::new(0));
    let base = spawn_flaky_server(run.clone(), opens.clone()).await;

    let watcher = SseWatcher::new(&base, "token")
        .unwrap()
        .with_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_attempts: 3,
        });
    let events: Vec<WatchEvent> =
        tokio::time::timeout(Duration::from_secs(5), watcher.watch(&run.id).unwrap().collect())
            .await
            .expect("watcher kept reconnecting after the run finished");

    assert_eq!(
        events,
        vec![
            WatchEvent::Connected,
            WatchEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(5)
            },
            WatchEvent::Progress(ProgressEvent::GenerationFailed {
                error: "write_sections: quota exceeded".into()
            }),
        ]
    );
    // The summary settled it; no second stream was opened
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_watcher_gives_up_on_refusal() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Private").await;
    let watcher = SseWatcher::new(&base(&app), app.token("mallory", Role::Editor)).unwrap();

    let events: Vec<WatchEvent> = watcher.watch(&run.id).unwrap().collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], WatchEvent::GaveUp { reason } if reason.contains("Forbidden")));
}

#[tokio::test]
async fn test_watcher_backs_off_then_gives_up() {
    // Reserve a port, then free it so every connect is refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let watcher = SseWatcher::new(&format!("http://{}", addr), "token")
        .unwrap()
        .with_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_attempts: 2,
        });
    let events: Vec<WatchEvent> = tokio::time::timeout(
        Duration::from_secs(5),
        watcher.watch(&RunId::new()).unwrap().collect(),
    )
    .await
    .unwrap();

    assert_eq!(
        events[..2].to_vec(),
        vec![
            WatchEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(5)
            },
            WatchEvent::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(10)
            },
        ]
    );
    assert!(matches!(events[2], WatchEvent::GaveUp { .. }));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_duplex_client_answers_interrupts() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Interactive").await;
    let mut client = DuplexClient::connect(&base(&app), &app.token("alice", Role::Editor))
        .await
        .unwrap();
    client.subscribe(&run.id).await.unwrap();

    let mut upstream = app
        .channel
        .subscribe(&ChannelId::for_run(&run.id))
        .await
        .unwrap();
    publish(
        &app,
        &run.id,
        ProgressEvent::InterruptWaiting {
            stage: "edit_review".into(),
            data: json!("Draft body"),
        },
    )
    .await;

    match client.next_message().await.unwrap() {
        Some(DuplexMessage::InterruptRequest { stage, data, .. }) => {
            assert_eq!(stage, "edit_review");
            assert_eq!(data, json!("Draft body"));
        }
        other => panic!("expected interrupt request, got {:?}", other),
    }

    client
        .edit(&run.id, "edit_review", json!("Polished body"))
        .await
        .unwrap();
    let _waiting = upstream.next().await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(2), upstream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        ProgressEvent::InterruptResponse {
            stage: "edit_review".into(),
            action: ReviewAction::Edit,
            feedback: None,
            updated_data: Some(json!("Polished body")),
        }
    );
    let _ = client.close().await;
}

#[tokio::test]
async fn test_duplex_client_reports_bad_token() {
    let app = TestApp::spawn().await;
    let err = DuplexClient::connect(&base(&app), "not-a-token")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ForgeError::Authentication(_)));
}
