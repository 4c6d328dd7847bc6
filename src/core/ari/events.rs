//! ARI event-stream payloads.
//!
//! Events are JSON with a `type` discriminator. Unknown event types fall
//! into [`AriEvent::Other`] and are ignored; the PBX emits far more than the
//! bridge consumes.

use serde::Deserialize;

/// Channel technology prefix of Asterisk-internal pseudo-legs.
const LOCAL_PREFIX: &str = "Local/";

/// Channel technology prefix of external-media RTP legs.
const EXTERNAL_MEDIA_PREFIX: &str = "UnicastRTP/";

/// Caller or connected-line identity as carried on a channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartyId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// ARI channel snapshot (the fields the bridge reads).
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: Option<PartyId>,
    #[serde(default)]
    pub connected: Option<PartyId>,
}

impl Channel {
    /// Asterisk `Local/` pseudo-leg, never bridged by us.
    pub fn is_local(&self) -> bool {
        self.name.starts_with(LOCAL_PREFIX)
    }

    /// External-media RTP leg originated by the bridge.
    pub fn is_external_media(&self) -> bool {
        self.name.starts_with(EXTERNAL_MEDIA_PREFIX)
    }

    /// Printable caller identity: number, then name, then the connected
    /// line's number and name, else empty.
    pub fn caller_identity(&self) -> String {
        let pick = |party: &Option<PartyId>, number_first: bool| -> Option<String> {
            let party = party.as_ref()?;
            let (first, second) = if number_first {
                (&party.number, &party.name)
            } else {
                (&party.name, &party.number)
            };
            if !first.is_empty() {
                Some(first.clone())
            } else if !second.is_empty() {
                Some(second.clone())
            } else {
                None
            }
        };
        pick(&self.caller, true)
            .or_else(|| pick(&self.connected, true))
            .unwrap_or_default()
    }
}

/// ARI bridge snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
}

/// Events consumed from the `/ari/events` WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    StasisEnd {
        channel: Channel,
    },
    ChannelDestroyed {
        channel: Channel,
    },
    BridgeDestroyed {
        bridge: Bridge,
    },
    #[serde(other)]
    Other,
}
