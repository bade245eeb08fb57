//! Remote collaborator reached through an HTTP bridge sidecar that owns the
//! platform wire protocol.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use url::Url;

use shared::domain::SyncCursor;

use crate::{
    raw::{DiffBatch, HistoryBatch, RawConversation, RawUser},
    remote::{Credentials, PeerRef, RemoteConnector, RemoteError, RemoteSession},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpBridgeConnector {
    http: Client,
    base_url: String,
}

impl HttpBridgeConnector {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .with_context(|| format!("invalid bridge url '{base_url}'"))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build bridge http client")?;
        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    app_id: i64,
    app_hash: &'a str,
    phone: &'a str,
    session_data: &'a str,
}

#[derive(Deserialize)]
struct ConnectResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct LiveResponse {
    live: bool,
}

#[derive(Serialize)]
struct HistoryRequest {
    peer: PeerRef,
    limit: u32,
    offset_id: i64,
}

#[derive(Serialize)]
struct DiffRequest {
    cursor: SyncCursor,
}

#[async_trait]
impl RemoteConnector for HttpBridgeConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&ConnectRequest {
                app_id: credentials.app_id,
                app_hash: &credentials.app_hash,
                phone: &credentials.phone,
                session_data: &credentials.session_data,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let opened: ConnectResponse = decode(check(response).await?).await?;
        debug!(bridge_session = %opened.session_id, "bridge session opened");
        Ok(Arc::new(HttpBridgeSession {
            http: self.http.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, opened.session_id),
        }))
    }
}

struct HttpBridgeSession {
    http: Client,
    session_url: String,
}

impl HttpBridgeSession {
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .http
            .get(format!("{}/{path}", self.session_url))
            .send()
            .await
            .map_err(transport_error)?;
        decode(check(response).await?).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self
            .http
            .post(format!("{}/{path}", self.session_url))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(check(response).await?).await
    }
}

#[async_trait]
impl RemoteSession for HttpBridgeSession {
    async fn is_live(&self) -> bool {
        match self.get::<LiveResponse>("live").await {
            Ok(response) => response.live,
            Err(err) => {
                debug!(error = %err, "bridge liveness probe failed");
                false
            }
        }
    }

    async fn self_user(&self) -> Result<RawUser, RemoteError> {
        self.get("self").await
    }

    async fn list_conversations(&self) -> Result<Vec<RawConversation>, RemoteError> {
        self.get("conversations").await
    }

    async fn fetch_history(
        &self,
        peer: PeerRef,
        limit: u32,
        offset_id: i64,
    ) -> Result<HistoryBatch, RemoteError> {
        self.post(
            "history",
            &HistoryRequest {
                peer,
                limit,
                offset_id,
            },
        )
        .await
    }

    async fn fetch_diff(&self, cursor: SyncCursor) -> Result<DiffBatch, RemoteError> {
        self.post("diff", &DiffRequest { cursor }).await
    }

    async fn fetch_current_state(&self) -> Result<SyncCursor, RemoteError> {
        self.get("state").await
    }

    async fn close(&self) {
        if let Err(err) = self.http.delete(&self.session_url).send().await {
            debug!(error = %err, "bridge session close failed");
        }
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("{status}: {detail}"))
        }
        status if status.is_server_error() => RemoteError::Transient(format!("{status}: {detail}")),
        status => RemoteError::Rejected(format!("{status}: {detail}")),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|err| RemoteError::Rejected(format!("malformed bridge response: {err}")))
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
