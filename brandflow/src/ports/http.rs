//! HTTP implementations of the state store and completion notifier.
//!
//! Both talk to the frontend's pipeline API under `{base}/api/pipeline/{run}`
//! and authenticate with the `X-Webhook-Secret` header. These types do not
//! retry on their own: the engine wraps every call in its retry policy, so
//! they only translate transport outcomes into tagged [`Failure`]s.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{CompletionNotifier, CompletionPayload, StageStatusUpdate, StateStore};
use crate::core::Run;
use crate::errors::{BrandflowError, ErrorPayload, Failure, FailureTag};

const SECRET_HEADER: &str = "X-Webhook-Secret";

#[derive(Debug, Clone)]
struct Endpoint {
    client: Client,
    base_url: String,
    secret: Option<String>,
    timeout: Duration,
}

impl Endpoint {
    fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BrandflowError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| BrandflowError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
            timeout,
        })
    }

    fn url(&self, run_id: &str, suffix: &str) -> String {
        format!("{}/api/pipeline/{run_id}{suffix}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.timeout(self.timeout);
        match &self.secret {
            Some(secret) => request.header(SECRET_HEADER, secret),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, channel: FailureTag) -> Result<Response, Failure> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| transport_failure(&e, channel))?;

        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "Pipeline API responded");
        if status.is_success() {
            Ok(response)
        } else {
            Err(status_failure(status, channel))
        }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        url: String,
        body: &T,
        channel: FailureTag,
    ) -> Result<(), Failure> {
        self.send(self.client.post(url).json(body), channel).await?;
        Ok(())
    }
}

fn transport_failure(err: &reqwest::Error, channel: FailureTag) -> Failure {
    if err.is_timeout() {
        Failure::timeout(format!("request timed out: {err}"))
    } else {
        Failure::tagged(channel, format!("request failed: {err}"))
    }
}

/// 429 is a rate limit, other 4xx will repeat on retry, 5xx belongs to the channel.
fn status_failure(status: StatusCode, channel: FailureTag) -> Failure {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Failure::rate_limited(format!("HTTP {status}"))
    } else if status.is_client_error() {
        Failure::logic(format!("request rejected with HTTP {status}"))
    } else {
        Failure::tagged(channel, format!("server error HTTP {status}"))
    }
}

/// State store backed by the pipeline HTTP API.
#[derive(Debug, Clone)]
pub struct HttpStateStore {
    endpoint: Endpoint,
}

impl HttpStateStore {
    /// Creates a store for `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BrandflowError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, secret, timeout)?,
        })
    }
}

#[async_trait]
impl StateStore for HttpStateStore {
    async fn report_run(&self, run: &Run) -> Result<(), Failure> {
        let url = self.endpoint.url(&run.run_id, "");
        self.endpoint
            .send(self.endpoint.client.put(url).json(run), FailureTag::StateStore)
            .await?;
        Ok(())
    }

    async fn report_stage_status(&self, update: &StageStatusUpdate) -> Result<(), Failure> {
        let url = self.endpoint.url(&update.run_id, "/stage-update");
        self.endpoint.post(url, update, FailureTag::StateStore).await
    }

    async fn report_failure(&self, payload: &ErrorPayload) -> Result<(), Failure> {
        let url = self.endpoint.url(&payload.run_id, "/failure");
        self.endpoint.post(url, payload, FailureTag::StateStore).await
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<Run>, Failure> {
        let url = self.endpoint.url(run_id, "/status");
        let request = self.endpoint.authorize(self.endpoint.client.get(url));
        let response = request
            .send()
            .await
            .map_err(|e| transport_failure(&e, FailureTag::StateStore))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<Run>()
                .await
                .map(Some)
                .map_err(|e| Failure::state_store(format!("invalid run record: {e}"))),
            status => Err(status_failure(status, FailureTag::StateStore)),
        }
    }
}

/// Completion notifier posting to `{base}/api/pipeline/{run}/complete`.
#[derive(Debug, Clone)]
pub struct HttpCompletionNotifier {
    endpoint: Endpoint,
}

impl HttpCompletionNotifier {
    /// Creates a notifier for `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BrandflowError> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, secret, timeout)?,
        })
    }
}

#[async_trait]
impl CompletionNotifier for HttpCompletionNotifier {
    async fn notify_complete(&self, payload: &CompletionPayload) -> Result<(), Failure> {
        let url = self.endpoint.url(&payload.run_id, "/complete");
        self.endpoint.post(url, payload, FailureTag::Delivery).await
    }
}
