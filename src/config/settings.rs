use serde::Deserialize;

/// Top-level configuration settings for a node and for the control broker.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub node: NodeSettings,
    pub broker: BrokerSettings,
    pub server: ServerSettings,
    pub discovery: DiscoverySettings,
    pub signaling: SignalingSettings,
    pub media: MediaSettings,
}

/// Identity of the local node.
///
/// `host` is the address advertised to peers in discovery announcements, so
/// it must be reachable from the other devices on the network.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    pub id: String,
    pub host: String,
}

/// Where the node finds the shared control broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration for running the control broker itself.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub retained_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverySettings {
    pub topic_base: String,
    pub last_will: bool,
}

/// Bounds applied to every signaling session.
#[derive(Debug, Deserialize, Clone)]
pub struct SignalingSettings {
    pub handshake_timeout_ms: u64,
    pub candidate_queue_limit: usize,
    pub pending_frame_limit: usize,
}

/// Dimensions attached to outbound video frames.
#[derive(Debug, Deserialize, Clone)]
pub struct MediaSettings {
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every section and field is optional; missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub node: Option<PartialNodeSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub server: Option<PartialServerSettings>,
    pub discovery: Option<PartialDiscoverySettings>,
    pub signaling: Option<PartialSignalingSettings>,
    pub media: Option<PartialMediaSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialNodeSettings {
    pub id: Option<String>,
    pub host: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub retained_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDiscoverySettings {
    pub topic_base: Option<String>,
    pub last_will: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSignalingSettings {
    pub handshake_timeout_ms: Option<u64>,
    pub candidate_queue_limit: Option<usize>,
    pub pending_frame_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialMediaSettings {
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                id: format!("node-{}", uuid::Uuid::new_v4()),
                host: "127.0.0.1".to_string(),
            },
            broker: BrokerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
            },
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 1883,
                retained_path: "meshsub_retained".to_string(),
            },
            discovery: DiscoverySettings {
                topic_base: "/meshsub/discovery".to_string(),
                last_will: true,
            },
            signaling: SignalingSettings {
                handshake_timeout_ms: 10_000,
                candidate_queue_limit: 32,
                pending_frame_limit: 64,
            },
            media: MediaSettings {
                frame_width: 640,
                frame_height: 480,
            },
        }
    }
}
