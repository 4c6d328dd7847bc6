//! ARI REST operations and the event-stream loop.
//!
//! REST calls authenticate with HTTP basic auth; the event WebSocket uses
//! the `api_key=user:pass` query parameter ARI expects. The operations sit
//! behind the [`ChannelControl`] trait so the orchestrator's teardown and
//! handoff flows can be driven against a mock in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::events::AriEvent;
use crate::config::BridgeConfig;
use crate::core::error::{BridgeError, BridgeResult};

/// Delay before reattempting the event-stream connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// PBX channel-control surface used by the orchestrator.
///
/// Every method maps to one ARI REST call. Implementations must be safe to
/// call concurrently from independent per-call tasks.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Create a mixing bridge; returns its id.
    async fn create_bridge(&self) -> BridgeResult<String>;
    async fn destroy_bridge(&self, bridge_id: &str) -> BridgeResult<()>;
    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> BridgeResult<()>;
    async fn answer(&self, channel_id: &str) -> BridgeResult<()>;
    async fn hangup(&self, channel_id: &str) -> BridgeResult<()>;
    /// Originate an external-media leg toward `external_host`; returns the
    /// new channel's id.
    async fn external_media(&self, external_host: &str) -> BridgeResult<String>;
    async fn continue_in_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        extension: &str,
        priority: i32,
    ) -> BridgeResult<()>;
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
}

/// ARI REST + event-stream client.
pub struct AriClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
    app: String,
    connected: Arc<AtomicBool>,
}

impl AriClient {
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        let mut base = Url::parse(&config.ari_url)
            .map_err(|e| BridgeError::InvalidConfiguration(format!("bad ARI_URL: {e}")))?;
        // Normalize so path joins below always append.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            username: config.ari_username.clone(),
            password: config.ari_password.clone(),
            app: config.ari_app.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True while the event WebSocket is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shared connectivity flag for the health probe.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        self.base
            .join(path)
            .map_err(|e| BridgeError::Control(format!("bad ARI path {path}: {e}")))
    }

    fn events_url(&self) -> BridgeResult<Url> {
        let mut url = self.endpoint("events")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| BridgeError::Control("cannot derive WebSocket scheme".into()))?;
        url.query_pairs_mut()
            .append_pair("app", &self.app)
            .append_pair("api_key", &format!("{}:{}", self.username, self.password))
            .append_pair("subscribeAll", "false");
        Ok(url)
    }

    async fn post(&self, url: Url) -> BridgeResult<reqwest::Response> {
        self.http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BridgeError::Control(e.to_string()))?
            .error_for_status()
            .map_err(|e| BridgeError::Control(e.to_string()))
    }

    async fn delete(&self, url: Url) -> BridgeResult<()> {
        self.http
            .delete(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BridgeError::Control(e.to_string()))?
            .error_for_status()
            .map_err(|e| BridgeError::Control(e.to_string()))?;
        Ok(())
    }

    /// Run the event-stream loop, feeding parsed events into `events` until
    /// the channel closes (shutdown) or the task is aborted. Reconnects with
    /// a fixed delay on connection loss.
    pub async fn run_events(&self, events: mpsc::Sender<AriEvent>) {
        loop {
            let url = match self.events_url() {
                Ok(url) => url,
                Err(e) => {
                    warn!("cannot build ARI events URL: {e}");
                    return;
                }
            };
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    info!("connected to PBX event stream");
                    self.connected.store(true, Ordering::SeqCst);
                    while let Some(frame) = ws.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<AriEvent>(&text) {
                                    Ok(AriEvent::Other) => {}
                                    Ok(event) => {
                                        if events.send(event).await.is_err() {
                                            debug!("event consumer gone, stopping PBX stream");
                                            self.connected.store(false, Ordering::SeqCst);
                                            return;
                                        }
                                    }
                                    Err(e) => debug!("unparseable PBX event: {e}"),
                                }
                            }
                            Ok(Message::Ping(data)) => {
                                if ws.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    self.connected.store(false, Ordering::SeqCst);
                    warn!("PBX event stream dropped, reconnecting");
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!("PBX event stream connect failed: {e}");
                }
            }
            if events.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[async_trait]
impl ChannelControl for AriClient {
    async fn create_bridge(&self) -> BridgeResult<String> {
        let mut url = self.endpoint("bridges")?;
        url.query_pairs_mut()
            .append_pair("type", "mixing,proxy_media");
        let bridge: CreatedResource = self
            .post(url)
            .await?
            .json()
            .await
            .map_err(|e| BridgeError::Control(e.to_string()))?;
        Ok(bridge.id)
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> BridgeResult<()> {
        let url = self.endpoint(&format!("bridges/{bridge_id}"))?;
        self.delete(url).await
    }

    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> BridgeResult<()> {
        let mut url = self.endpoint(&format!("bridges/{bridge_id}/addChannel"))?;
        url.query_pairs_mut().append_pair("channel", channel_id);
        self.post(url).await.map(|_| ())
    }

    async fn answer(&self, channel_id: &str) -> BridgeResult<()> {
        let url = self.endpoint(&format!("channels/{channel_id}/answer"))?;
        self.post(url).await.map(|_| ())
    }

    async fn hangup(&self, channel_id: &str) -> BridgeResult<()> {
        let url = self.endpoint(&format!("channels/{channel_id}"))?;
        self.delete(url).await
    }

    async fn external_media(&self, external_host: &str) -> BridgeResult<String> {
        let mut url = self.endpoint("channels/externalMedia")?;
        url.query_pairs_mut()
            .append_pair("app", &self.app)
            .append_pair("external_host", external_host)
            .append_pair("format", "ulaw")
            .append_pair("transport", "udp")
            .append_pair("encapsulation", "rtp")
            .append_pair("connection_type", "client")
            .append_pair("direction", "both");
        let channel: CreatedResource = self
            .post(url)
            .await?
            .json()
            .await
            .map_err(|e| BridgeError::Control(e.to_string()))?;
        Ok(channel.id)
    }

    async fn continue_in_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        extension: &str,
        priority: i32,
    ) -> BridgeResult<()> {
        let mut url = self.endpoint(&format!("channels/{channel_id}/continue"))?;
        url.query_pairs_mut()
            .append_pair("context", context)
            .append_pair("extension", extension)
            .append_pair("priority", &priority.to_string());
        self.post(url).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            ari_url: "http://pbx.local:8088/ari".into(),
            ari_username: "ari".into(),
            ari_password: "secret".into(),
            ari_app: "voicebridge".into(),
            openai_api_key: "sk-test".into(),
            realtime_url: "wss://api.openai.com/v1/realtime".into(),
            realtime_model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            system_prompt: String::new(),
            initial_message: "Hi".into(),
            transcription_model: "whisper-1".into(),
            transcription_language: "en".into(),
            vad: crate::config::VadSettings::SemanticVad,
            rtp_port_start: 12000,
            max_concurrent_calls: 4,
            silence_padding_ms: 100,
            redirection_queue: None,
            redirection_queue_context: None,
            redirection_phrases: Vec::new(),
            agent_terminate_phrases: Vec::new(),
            recordings_dir: "/tmp".into(),
            call_duration_limit: None,
            cleanup_grace: Duration::from_millis(1500),
            terminate_fallback: Duration::from_millis(8000),
            termination_watchdog: Duration::from_millis(8000),
            shutdown_timeout: Duration::from_millis(8000),
            health_port: 0,
            email: None,
        }
    }

    #[test]
    fn events_url_carries_app_and_credentials() {
        let client = AriClient::new(&test_config()).unwrap();
        let url = client.events_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert!(url.path().ends_with("/ari/events"));
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("app".into(), "voicebridge".into())));
        assert!(query.contains(&("api_key".into(), "ari:secret".into())));
    }

    #[test]
    fn endpoints_join_under_the_base_path() {
        let client = AriClient::new(&test_config()).unwrap();
        assert_eq!(
            client.endpoint("bridges").unwrap().as_str(),
            "http://pbx.local:8088/ari/bridges"
        );
        assert_eq!(
            client
                .endpoint("channels/c1/answer")
                .unwrap()
                .as_str(),
            "http://pbx.local:8088/ari/channels/c1/answer"
        );
    }
}
