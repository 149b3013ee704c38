use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::media::MediaConstraints;
use crate::path::ProposalPolicy;
use crate::transport::ice_config::DEFAULT_FETCH_TIMEOUT;
use crate::transport::{IceConfigLoader, TransportConfig};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_filter: String,
    pub ice_template: Option<String>,
    pub ice_config_url: Option<Url>,
    pub ice_fetch_timeout: Duration,
    pub media_preset: String,
    pub prune_policy: PrunePolicy,
    pub path_controller: bool,
    pub path_stats_interval: Duration,
    pub channel: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,peerlink_core=debug".into());
        let ice_template = std::env::var("PEERLINK_ICE_TEMPLATE")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let ice_config_url = std::env::var("PEERLINK_ICE_CONFIG_URL")
            .ok()
            .and_then(|raw| match Url::parse(&raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(url = %raw, error = %err, "ignoring invalid PEERLINK_ICE_CONFIG_URL");
                    None
                }
            });
        let ice_fetch_timeout = std::env::var("PEERLINK_ICE_FETCH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT);
        let media_preset = std::env::var("PEERLINK_MEDIA").unwrap_or_default();
        let prune_policy = PrunePolicy::from_env();
        let path_controller = std::env::var("PEERLINK_PATH_CONTROLLER")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(true);
        let path_stats_interval = std::env::var("PEERLINK_PATH_STATS_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(500));
        let channel = std::env::var("PEERLINK_CHANNEL").unwrap_or_else(|_| "webrtc".into());
        Self {
            log_filter,
            ice_template,
            ice_config_url,
            ice_fetch_timeout,
            media_preset,
            prune_policy,
            path_controller,
            path_stats_interval,
            channel,
        }
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints::from_preset(Some(&self.media_preset))
    }

    pub fn ice_loader(&self) -> IceConfigLoader {
        IceConfigLoader::new(self.ice_config_url.clone(), self.ice_fetch_timeout)
    }

    /// Resolves the ICE configuration and packages the transport settings.
    pub async fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice: self.ice_loader().load(self.ice_template.as_deref()).await,
            path_controller: self.path_controller,
            stats_interval: self.path_stats_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Veto prunes in loopback mode, accept them otherwise.
    Auto,
    Accept,
    Veto,
}

impl PrunePolicy {
    fn from_env() -> Self {
        std::env::var("PEERLINK_PRUNE_POLICY")
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(PrunePolicy::Auto)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(PrunePolicy::Auto),
            "accept" => Some(PrunePolicy::Accept),
            "veto" => Some(PrunePolicy::Veto),
            _ => None,
        }
    }

    pub fn proposal_policy(self, loopback: bool) -> ProposalPolicy {
        match (self, loopback) {
            (PrunePolicy::Veto, _) | (PrunePolicy::Auto, true) => ProposalPolicy::preserve_pairs(),
            _ => ProposalPolicy::accept_all(),
        }
    }
}
