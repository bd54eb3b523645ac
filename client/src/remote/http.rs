//! HTTP + WebSocket adapter for `chartsync-server`.

use async_trait::async_trait;
use chartsync_engine::protocol::{LiveRequest, PullQuery, PushRequest};
use chartsync_engine::{
    Checkpoint, LiveMessage, PullBatch, PushDocument, PushResult, ReplicationIdentity,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::{RemoteSignal, RemoteStore};
use crate::config::RemoteSettings;
use crate::error::NetworkError;

/// Keepalive interval on the live channel.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Buffered live signals per watcher.
const SIGNAL_BUFFER: usize = 16;

/// Remote reached over HTTP, with a WebSocket live channel.
pub struct HttpRemote {
    client: reqwest::Client,
    settings: RemoteSettings,
}

impl HttpRemote {
    pub fn new(settings: RemoteSettings) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    /// `{endpoint}/{route}/{collection}`, keeping any base path of the endpoint.
    fn route_url(&self, route: &str, identity: &ReplicationIdentity) -> String {
        format!(
            "{}/{route}/{}",
            self.settings.endpoint.trim_end_matches('/'),
            identity.collection
        )
    }

    fn sync_url(&self, identity: &ReplicationIdentity) -> String {
        self.route_url("sync", identity)
    }

    fn live_url(&self, identity: &ReplicationIdentity) -> Result<url::Url, NetworkError> {
        let mut url = url::Url::parse(&self.route_url("ws", identity))
            .map_err(|e| NetworkError::Live(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| NetworkError::Live(format!("cannot derive live url from {}", self.settings.endpoint)))?;
        url.query_pairs_mut().append_pair("owner", &identity.owner_id);
        Ok(url)
    }

    /// Turn a non-success response into a status error.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, NetworkError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(NetworkError::Status { status, message })
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    async fn pull(
        &self,
        identity: &ReplicationIdentity,
        since: Option<Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, NetworkError> {
        let query = PullQuery {
            owner: identity.owner_id.clone(),
            since: since.map(|c| c.0),
            limit: Some(limit),
        };
        let response = self
            .client
            .get(self.sync_url(identity))
            .bearer_auth(&self.settings.token)
            .query(&query)
            .send()
            .await?;
        let batch: PullBatch = Self::check(response).await?.json().await?;
        debug!(count = batch.documents.len(), has_more = batch.has_more, "pulled batch");
        Ok(batch)
    }

    async fn push(
        &self,
        identity: &ReplicationIdentity,
        documents: Vec<PushDocument>,
    ) -> Result<PushResult, NetworkError> {
        let documents = documents
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NetworkError::Decode(e.to_string()))?;
        let request = PushRequest {
            owner_id: identity.owner_id.clone(),
            documents,
        };
        let response = self
            .client
            .post(self.sync_url(identity))
            .bearer_auth(&self.settings.token)
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn watch(
        &self,
        identity: &ReplicationIdentity,
    ) -> Result<mpsc::Receiver<RemoteSignal>, NetworkError> {
        let url = self.live_url(identity)?;
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.settings.token))
            .map_err(|e| NetworkError::Live(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, response) = timeout(self.settings.timeout, connect_async(request))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        info!(url = %url, status = ?response.status(), "live channel connected");

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        tokio::spawn(async move {
            let (mut write, mut read) = stream.split();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    message = read.next() => match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<LiveMessage>(text.as_str()) {
                                Ok(LiveMessage::ChangesAvailable { checkpoint, .. }) => {
                                    let signal = RemoteSignal::ChangesAvailable { checkpoint };
                                    if tx.send(signal).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(LiveMessage::Pong) => debug!("live pong"),
                                Ok(LiveMessage::Error { message }) => {
                                    warn!(%message, "live channel error from remote");
                                }
                                Err(e) => warn!(error = %e, "unparseable live message"),
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if write.send(WsMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "live channel closed by remote");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "live channel failed");
                            break;
                        }
                        None => break,
                    },
                    _ = ping.tick() => {
                        let Ok(json) = serde_json::to_string(&LiveRequest::Ping) else { continue };
                        if write.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("live channel task stopped");
        });

        Ok(rx)
    }
}
