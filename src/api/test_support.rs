// Shared fixture for API tests: a live server on an ephemeral port
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::{AuthProvider, Identity, JwtAuthProvider, Role};
use crate::api::{create_router, AppState};
use crate::config::{AuthSettings, RelaySettings};
use crate::engine::channel::InMemoryProgressChannel;
use crate::engine::queue::{JobQueue, JobReceiver, RetentionPolicy};
use crate::engine::storage::{InMemoryRunStore, RunLease, RunStore};
use crate::models::{GenerationRequest, Run, RunId, RunUpdate};

pub(crate) struct TestApp {
    pub addr: SocketAddr,
    pub store: Arc<InMemoryRunStore>,
    pub channel: Arc<InMemoryProgressChannel>,
    pub queue: JobQueue,
    pub state: AppState,
    auth: Arc<JwtAuthProvider>,
    _jobs: JobReceiver,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_heartbeat(Duration::from_secs(15)).await
    }

    pub async fn spawn_with_heartbeat(heartbeat: Duration) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let channel = Arc::new(InMemoryProgressChannel::new());
        let (queue, jobs) = JobQueue::new(RetentionPolicy::default());
        let auth = Arc::new(JwtAuthProvider::new(&AuthSettings {
            jwt_secret: "api-test-secret".to_string(),
            token_ttl_secs: 3600,
        }));
        let relay = RelaySettings {
            heartbeat_secs: heartbeat.as_secs(),
            channel_capacity: 64,
            outbound_buffer: 8,
        };
        let state = AppState::new(
            store.clone(),
            channel.clone(),
            queue.clone(),
            auth.clone() as Arc<dyn AuthProvider>,
            relay,
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone(), false);
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        Self {
            addr,
            store,
            channel,
            queue,
            state,
            auth,
            _jobs: jobs,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/api/ws/generation{}", self.addr, query)
    }

    pub fn token(&self, user_id: &str, role: Role) -> String {
        self.auth.issue(&Identity::new(user_id, role)).unwrap()
    }

    /// Insert a pending run directly into the store
    pub async fn seed_run(&self, owner_id: &str, topic: &str) -> Run {
        let run = Run::new(RunId::new(), owner_id, GenerationRequest::new(topic));
        self.store.create_run(run).await.unwrap()
    }

    /// Drive a seeded run to a final status without publishing anything
    pub async fn finish_run(&self, run_id: &RunId, update: RunUpdate) -> Run {
        let lease = RunLease::new(run_id.clone(), "test-worker");
        self.store.claim_run(&lease).await.unwrap();
        self.store.update_run(&lease, update).await.unwrap()
    }
}
