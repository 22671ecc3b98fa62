// HTTP relay client.
//
// REST contract of the hosted relay:
//
//   PUT  /v1/heartbeats/{device_id}                      Body: HeartbeatRecord
//   GET  /v1/workspaces/{ws}/heartbeats                  → [HeartbeatRecord]
//   POST /v1/locks/acquire                               Body: LockRequest → { ok }
//   POST /v1/locks/refresh                               Body: LockRequest → { ok }
//   POST /v1/locks/release                               Body: LockRequest → { ok }
//   POST /v1/messages                                    Body: PeerMessage
//   GET  /v1/workspaces/{ws}/devices/{id}/messages       → [PeerMessage]
//
// All calls carry the device token as a bearer credential when one is set.

use super::retry::{with_retry, RetryPolicy};
use super::{HeartbeatRecord, Relay};
use crate::errors::CoordError;
use crate::messaging::PeerMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client for the hosted relay.
pub struct HttpRelay {
    base_url: String,
    token: Option<String>,
    http: Client,
    retry: RetryPolicy,
}

/// Body for the three lock endpoints.
#[derive(Debug, Serialize)]
pub struct LockRequest<'a> {
    pub resource: &'a str,
    pub workspace_id: Uuid,
    pub holder_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    ok: bool,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 5xx, 408 and 429 stay retryable; any other 4xx is a `RelayRejected`.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let transient = status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS;
        if !transient && status.is_client_error() {
            return Err(CoordError::RelayRejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        anyhow::bail!("Relay error {}: {}", status, body)
    }

    async fn lock_call(&self, action: &str, req: LockRequest<'_>) -> Result<bool> {
        let url = format!("{}/v1/locks/{}", self.base_url, action);
        with_retry(self.retry, || async {
            let resp = self
                .authed(self.http.post(&url))
                .json(&req)
                .send()
                .await
                .context("Failed to reach relay")?;
            let resp = Self::check(resp).await?;
            let body: LockResponse = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse lock {} response", action))?;
            Ok(body.ok)
        })
        .await
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn upsert_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        let url = format!("{}/v1/heartbeats/{}", self.base_url, record.id);
        with_retry(self.retry, || async {
            let resp = self
                .authed(self.http.put(&url))
                .json(record)
                .send()
                .await
                .context("Failed to reach relay")?;
            Self::check(resp).await?;
            Ok(())
        })
        .await
    }

    async fn list_heartbeats(&self, workspace_id: Uuid) -> Result<Vec<HeartbeatRecord>> {
        let url = format!("{}/v1/workspaces/{}/heartbeats", self.base_url, workspace_id);
        with_retry(self.retry, || async {
            let resp = self
                .authed(self.http.get(&url))
                .send()
                .await
                .context("Failed to reach relay")?;
            Self::check(resp)
                .await?
                .json::<Vec<HeartbeatRecord>>()
                .await
                .context("Failed to parse heartbeat list")
        })
        .await
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool> {
        self.lock_call(
            "acquire",
            LockRequest {
                resource,
                workspace_id,
                holder_id,
                lease_secs: Some(lease.num_seconds()),
            },
        )
        .await
    }

    async fn refresh_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool> {
        self.lock_call(
            "refresh",
            LockRequest {
                resource,
                workspace_id,
                holder_id,
                lease_secs: Some(lease.num_seconds()),
            },
        )
        .await
    }

    async fn release_lock(&self, resource: &str, workspace_id: Uuid, holder_id: Uuid) -> Result<bool> {
        self.lock_call(
            "release",
            LockRequest {
                resource,
                workspace_id,
                holder_id,
                lease_secs: None,
            },
        )
        .await
    }

    async fn push_message(&self, message: &PeerMessage) -> Result<()> {
        let url = format!("{}/v1/messages", self.base_url);
        with_retry(self.retry, || async {
            let resp = self
                .authed(self.http.post(&url))
                .json(message)
                .send()
                .await
                .context("Failed to reach relay")?;
            Self::check(resp).await?;
            Ok(())
        })
        .await
    }

    async fn pull_messages(&self, workspace_id: Uuid, device_id: Uuid) -> Result<Vec<PeerMessage>> {
        let url = format!(
            "{}/v1/workspaces/{}/devices/{}/messages",
            self.base_url, workspace_id, device_id
        );
        with_retry(self.retry, || async {
            let resp = self
                .authed(self.http.get(&url))
                .send()
                .await
                .context("Failed to reach relay")?;
            Self::check(resp)
                .await?
                .json::<Vec<PeerMessage>>()
                .await
                .context("Failed to parse message batch")
        })
        .await
    }
}
