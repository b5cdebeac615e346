use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

pub const FALLBACK_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Static STUN/TURN entries from the `[ice]` config section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceSettings {
    pub stun: Option<String>,
    pub turn: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

/// Peer-connection configuration shared by every call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Stun,
    Turn,
}

/// Accepts `stun:host[:port]` style urls; the `//` authority form is not a
/// valid ICE url.
fn scheme_of(raw: &str) -> Option<Scheme> {
    let url = Url::parse(raw).ok()?;
    if !url.cannot_be_a_base() {
        return None;
    }
    let host = url.path().split(':').next().unwrap_or_default();
    if host.is_empty() {
        return None;
    }
    match url.scheme() {
        "stun" | "stuns" => Some(Scheme::Stun),
        "turn" | "turns" => Some(Scheme::Turn),
        _ => None,
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Drop malformed urls from an entry. TURN urls need credentials; an entry
/// left without urls is dropped altogether.
fn sanitize(server: &IceServer) -> Option<IceServer> {
    let credentialed = has_text(&server.username) && has_text(&server.credential);
    let urls: Vec<String> = server
        .urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| match scheme_of(url) {
            Some(Scheme::Stun) => true,
            Some(Scheme::Turn) if credentialed => true,
            Some(Scheme::Turn) => {
                warn!(url, "dropping turn server without credentials");
                false
            }
            None => {
                warn!(url, "dropping malformed ice server url");
                false
            }
        })
        .map(str::to_string)
        .collect();
    if urls.is_empty() {
        return None;
    }
    Some(IceServer {
        urls,
        username: server.username.clone(),
        credential: server.credential.clone(),
    })
}

/// Build the ordered ICE server list: overrides, then the configured TURN
/// entry, then the configured STUN entry. Duplicate urls keep their first
/// position. Falls back to a public STUN server when nothing usable remains.
pub fn build_ice_config(settings: &IceSettings, overrides: Option<&[IceServer]>) -> IceConfig {
    let mut candidates: Vec<IceServer> = overrides.map(|o| o.to_vec()).unwrap_or_default();
    if let Some(turn) = settings.turn.as_ref().filter(|t| !t.trim().is_empty()) {
        candidates.push(IceServer {
            urls: vec![turn.clone()],
            username: settings.turn_username.clone(),
            credential: settings.turn_credential.clone(),
        });
    }
    if let Some(stun) = settings.stun.as_ref().filter(|s| !s.trim().is_empty()) {
        candidates.push(IceServer {
            urls: vec![stun.clone()],
            ..Default::default()
        });
    }

    let mut seen: Vec<String> = Vec::new();
    let mut ice_servers = Vec::new();
    for candidate in candidates.iter().filter_map(sanitize) {
        let urls: Vec<String> = candidate
            .urls
            .into_iter()
            .filter(|url| {
                if seen.contains(url) {
                    false
                } else {
                    seen.push(url.clone());
                    true
                }
            })
            .collect();
        if !urls.is_empty() {
            ice_servers.push(IceServer { urls, ..candidate });
        }
    }

    if ice_servers.is_empty() {
        debug!("no usable ice servers configured, using {}", FALLBACK_STUN_SERVER);
        ice_servers.push(IceServer {
            urls: vec![FALLBACK_STUN_SERVER.to_string()],
            ..Default::default()
        });
    }

    IceConfig {
        ice_servers,
        ice_transport_policy: IceTransportPolicy::All,
        bundle_policy: BundlePolicy::MaxBundle,
        rtcp_mux_policy: RtcpMuxPolicy::Negotiate,
    }
}

impl From<&IceConfig> for RTCConfiguration {
    fn from(config: &IceConfig) -> Self {
        RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            bundle_policy: match config.bundle_policy {
                BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
                BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
                BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
            },
            rtcp_mux_policy: match config.rtcp_mux_policy {
                RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
                RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_settings() -> IceSettings {
        IceSettings {
            stun: Some("stun:stun.example.com:3478".to_string()),
            turn: Some("turn:turn.example.com:3478".to_string()),
            turn_username: Some("agent".to_string()),
            turn_credential: Some("pw".to_string()),
        }
    }

    #[test]
    fn test_never_empty() {
        let config = build_ice_config(&IceSettings::default(), None);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![FALLBACK_STUN_SERVER]);
        assert_eq!(config.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(config.bundle_policy, BundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RtcpMuxPolicy::Negotiate);
    }

    #[test]
    fn test_precedence_and_dedup() {
        let overrides = vec![IceServer {
            urls: vec![
                "stun:override.example.com".to_string(),
                "stun:stun.example.com:3478".to_string(),
            ],
            ..Default::default()
        }];
        let config = build_ice_config(&turn_settings(), Some(&overrides));
        let urls: Vec<&str> = config
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter().map(String::as_str))
            .collect();
        assert_eq!(
            urls,
            vec![
                "stun:override.example.com",
                "stun:stun.example.com:3478",
                "turn:turn.example.com:3478",
            ]
        );
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("agent"));
    }

    #[test]
    fn test_malformed_entries_dropped() {
        let mut settings = turn_settings();
        settings.turn_credential = None;
        let overrides = vec![IceServer {
            urls: vec![
                "http://nope".to_string(),
                "stun:".to_string(),
                "stun://double.example.com".to_string(),
            ],
            ..Default::default()
        }];
        let config = build_ice_config(&settings, Some(&overrides));
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.com:3478"]);
    }

    #[test]
    fn test_rtc_configuration() {
        let config = build_ice_config(&turn_settings(), None);
        let rtc: RTCConfiguration = (&config).into();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[0].username, "agent");
        assert_eq!(rtc.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(rtc.rtcp_mux_policy, RTCRtcpMuxPolicy::Negotiate);
    }
}
