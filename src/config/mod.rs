mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DiscoverySettings, MediaSettings, NodeSettings, ServerSettings, Settings,
    SignalingSettings,
};

/// Loads the configuration from `config/default` and `MESHSUB_*` environment
/// variables, then fills every missing value from `Settings::default()`.
///
/// Nested keys use a double underscore, e.g. `MESHSUB_SIGNALING__HANDSHAKE_TIMEOUT_MS`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MESHSUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    Settings {
        node: NodeSettings {
            id: partial
                .node
                .as_ref()
                .and_then(|n| n.id.clone())
                .unwrap_or(default.node.id),
            host: partial
                .node
                .as_ref()
                .and_then(|n| n.host.clone())
                .unwrap_or(default.node.host),
        },
        broker: BrokerSettings {
            host: partial
                .broker
                .as_ref()
                .and_then(|b| b.host.clone())
                .unwrap_or(default.broker.host),
            port: partial
                .broker
                .as_ref()
                .and_then(|b| b.port)
                .unwrap_or(default.broker.port),
        },
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            retained_path: partial
                .server
                .as_ref()
                .and_then(|s| s.retained_path.clone())
                .unwrap_or(default.server.retained_path),
        },
        discovery: DiscoverySettings {
            topic_base: partial
                .discovery
                .as_ref()
                .and_then(|d| d.topic_base.clone())
                .unwrap_or(default.discovery.topic_base),
            last_will: partial
                .discovery
                .as_ref()
                .and_then(|d| d.last_will)
                .unwrap_or(default.discovery.last_will),
        },
        signaling: SignalingSettings {
            handshake_timeout_ms: partial
                .signaling
                .as_ref()
                .and_then(|s| s.handshake_timeout_ms)
                .unwrap_or(default.signaling.handshake_timeout_ms),
            candidate_queue_limit: partial
                .signaling
                .as_ref()
                .and_then(|s| s.candidate_queue_limit)
                .unwrap_or(default.signaling.candidate_queue_limit),
            pending_frame_limit: partial
                .signaling
                .as_ref()
                .and_then(|s| s.pending_frame_limit)
                .unwrap_or(default.signaling.pending_frame_limit),
        },
        media: MediaSettings {
            frame_width: partial
                .media
                .as_ref()
                .and_then(|m| m.frame_width)
                .unwrap_or(default.media.frame_width),
            frame_height: partial
                .media
                .as_ref()
                .and_then(|m| m.frame_height)
                .unwrap_or(default.media.frame_height),
        },
    }
}
