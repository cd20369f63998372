// REST client for generation runs

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::types::{
    ErrorBody, GenerationResponse, ReviewAccepted, ReviewRequest, RunPage,
};
use crate::client::{parse_base_url, status_error};
use crate::models::{GenerationRequest, ReviewDecision, Run, RunId};
use crate::{ForgeError, Result};

/// Typed wrapper over the REST endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            base_url: parse_base_url(base_url)?,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ForgeError::InvalidInput(format!("invalid path '{}': {}", path, e)))
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ForgeError::Transport(e.to_string()))?;
        decode(response).await
    }

    /// `POST /api/generations`
    pub async fn create_generation(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let url = self.endpoint("/api/generations")?;
        self.execute(self.client.post(url).json(request)).await
    }

    /// `GET /api/generations/:id`
    pub async fn get_generation(&self, run_id: &RunId) -> Result<Run> {
        let url = self.endpoint(&format!("/api/generations/{}", run_id))?;
        self.execute(self.client.get(url)).await
    }

    /// `GET /api/generations?page=&per_page=`
    pub async fn list_generations(&self, page: usize, per_page: usize) -> Result<RunPage> {
        let url = self.endpoint("/api/generations")?;
        let query = [("page", page.to_string()), ("per_page", per_page.to_string())];
        self.execute(self.client.get(url).query(&query)).await
    }

    /// `POST /api/generations/:id/review`
    pub async fn submit_review(
        &self,
        run_id: &RunId,
        stage: &str,
        decision: &ReviewDecision,
    ) -> Result<ReviewAccepted> {
        let url = self.endpoint(&format!("/api/generations/{}/review", run_id))?;
        let body = review_body(stage, decision);
        self.execute(self.client.post(url).json(&body)).await
    }
}

fn review_body(stage: &str, decision: &ReviewDecision) -> ReviewRequest {
    let (feedback, updated_data) = match decision {
        ReviewDecision::Approve => (None, None),
        ReviewDecision::Reject { feedback } => (Some(feedback.clone()), None),
        ReviewDecision::Edit { content } => (None, Some(content.clone())),
    };
    ReviewRequest {
        stage: stage.to_string(),
        action: decision.action(),
        feedback,
        updated_data,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ForgeError::Transport(format!("invalid response body: {}", e)));
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(status_error(status, message))
}
