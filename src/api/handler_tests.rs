// REST endpoint tests against a live server
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use crate::api::auth::Role;
use crate::api::test_support::TestApp;
use crate::engine::channel::{ChannelId, ProgressChannel};
use crate::engine::queue::JobState;
use crate::models::{ProgressEvent, ReviewAction, RunId};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn().await;
    let response = client().get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_generation_enqueues_run() {
    let app = TestApp::spawn().await;
    let token = app.token("alice", Role::Editor);

    let response = client()
        .post(app.url("/api/generations"))
        .bearer_auth(&token)
        .json(&json!({ "topic": "Rust async runtimes", "enable_outline_review": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["queued"], true);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["owner_id"], "alice");

    let run_id = RunId::parse(body["id"].as_str().unwrap()).unwrap();
    assert!(app.store_has(&run_id).await);
    assert_eq!(app.queue.get(&run_id).unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn test_create_generation_requires_token_and_write_role() {
    let app = TestApp::spawn().await;

    let anonymous = client()
        .post(app.url("/api/generations"))
        .json(&json!({ "topic": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let viewer = client()
        .post(app.url("/api/generations"))
        .bearer_auth(app.token("vera", Role::Viewer))
        .json(&json!({ "topic": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(viewer.status(), StatusCode::FORBIDDEN);

    let blank = client()
        .post(app.url("/api/generations"))
        .bearer_auth(app.token("alice", Role::Editor))
        .json(&json!({ "topic": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    let body: Value = blank.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("topic"));
}

#[tokio::test]
async fn test_get_generation_enforces_ownership() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Ownership").await;
    let path = format!("/api/generations/{}", run.id);

    let owner = client()
        .get(app.url(&path))
        .bearer_auth(app.token("alice", Role::Editor))
        .send()
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);

    let stranger = client()
        .get(app.url(&path))
        .bearer_auth(app.token("mallory", Role::Editor))
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

    let admin = client()
        .get(app.url(&path))
        .bearer_auth(app.token("root", Role::Admin))
        .send()
        .await
        .unwrap();
    assert_eq!(admin.status(), StatusCode::OK);

    let missing = client()
        .get(app.url("/api/generations/does-not-exist"))
        .bearer_auth(app.token("root", Role::Admin))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_generations_is_scoped_and_paginated() {
    let app = TestApp::spawn().await;
    for topic in ["one", "two", "three"] {
        app.seed_run("alice", topic).await;
    }
    app.seed_run("bob", "not yours").await;

    let page: Value = client()
        .get(app.url("/api/generations?page=2&per_page=2"))
        .bearer_auth(app.token("alice", Role::Editor))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["total_pages"], 2);
    assert_eq!(page["data"].as_array().unwrap().len(), 1);

    let everything: Value = client()
        .get(app.url("/api/generations?per_page=500"))
        .bearer_auth(app.token("root", Role::Admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(everything["total"], 4);
    assert_eq!(everything["per_page"], 100);
}

#[tokio::test]
async fn test_review_is_republished_on_the_run_channel() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Reviews").await;
    let mut events = app
        .channel
        .subscribe(&ChannelId::for_run(&run.id))
        .await
        .unwrap();

    let response = client()
        .post(app.url(&format!("/api/generations/{}/review", run.id)))
        .bearer_auth(app.token("alice", Role::Editor))
        .json(&json!({ "stage": "outline_review", "action": "reject", "feedback": "add a section on pinning" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ProgressEvent::InterruptResponse {
            stage: "outline_review".to_string(),
            action: ReviewAction::Reject,
            feedback: Some("add a section on pinning".to_string()),
            updated_data: None,
        }
    );
}

#[tokio::test]
async fn test_review_validation() {
    let app = TestApp::spawn().await;
    let run = app.seed_run("alice", "Validation").await;
    let path = format!("/api/generations/{}/review", run.id);

    let no_feedback = client()
        .post(app.url(&path))
        .bearer_auth(app.token("alice", Role::Editor))
        .json(&json!({ "stage": "outline_review", "action": "reject" }))
        .send()
        .await
        .unwrap();
    assert_eq!(no_feedback.status(), StatusCode::BAD_REQUEST);

    let no_stage = client()
        .post(app.url(&path))
        .bearer_auth(app.token("alice", Role::Editor))
        .json(&json!({ "stage": "", "action": "approve" }))
        .send()
        .await
        .unwrap();
    assert_eq!(no_stage.status(), StatusCode::BAD_REQUEST);

    let viewer = client()
        .post(app.url(&path))
        .bearer_auth(app.token("alice", Role::Viewer))
        .json(&json!({ "stage": "outline_review", "action": "approve" }))
        .send()
        .await
        .unwrap();
    assert_eq!(viewer.status(), StatusCode::FORBIDDEN);

    let stranger = client()
        .post(app.url(&path))
        .bearer_auth(app.token("mallory", Role::Editor))
        .json(&json!({ "stage": "outline_review", "action": "approve" }))
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = TestApp::spawn().await;
    let response = client().get(app.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

impl TestApp {
    async fn store_has(&self, run_id: &RunId) -> bool {
        use crate::engine::storage::RunStore;
        self.store.get_run(run_id).await.unwrap().is_some()
    }
}
