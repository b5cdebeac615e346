use crate::error::ConfigError;
use crate::media::ice::{IceServer, IceSettings};
use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const USER_AGENT: &str = "agentphone";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "agentphone.toml")]
    pub conf: Option<String>,
    /// Override the backend base URL from the config file
    #[clap(long)]
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub agent: AgentConfig,
    pub sip: SipConfig,
    pub ice: IceSettings,
    pub registration: RegistrationConfig,
    pub backend: Option<BackendConfig>,
    pub lock: LockConfig,
}

/// Agent settings as supplied by the config file or the backend. Every field
/// is optional here; [`AgentConfig::validate`] decides whether registration
/// may be attempted.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    pub extension: Option<String>,
    pub credential: Option<String>,
    pub signaling_domain: Option<String>,
    pub transport_endpoint: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    pub preferred_device_label: Option<String>,
}

/// Validated agent identity. Immutable for the lifetime of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentIdentity {
    pub extension: String,
    pub credential: String,
    pub signaling_domain: String,
    pub transport_endpoint: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SipConfig {
    pub addr: String,
    pub udp_port: u16,
    pub useragent: Option<String>,
    pub register_expires: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RegistrationConfig {
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    pub poll_interval_secs: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            udp_port: 25060,
            useragent: Some(crate::version::user_agent()),
            register_expires: 300,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_initial_secs: 2,
            retry_max_secs: 60,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            agent: AgentConfig::default(),
            sip: SipConfig::default(),
            ice: IceSettings::default(),
            registration: RegistrationConfig::default(),
            backend: None,
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn validate_agent_fields(&self) -> Result<AgentIdentity, ConfigError> {
        self.agent.validate()
    }
}

impl SipConfig {
    pub fn local_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.addr, self.udp_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "sip.addr",
                reason: e.to_string(),
            })
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::MissingField(field)),
    }
}

impl AgentConfig {
    /// Fill fields this config lacks from `other`, keeping what is already set.
    pub fn merge_missing(&mut self, other: AgentConfig) {
        if self.extension.is_none() {
            self.extension = other.extension;
        }
        if self.credential.is_none() {
            self.credential = other.credential;
        }
        if self.signaling_domain.is_none() {
            self.signaling_domain = other.signaling_domain;
        }
        if self.transport_endpoint.is_none() {
            self.transport_endpoint = other.transport_endpoint;
        }
        if self.ice_servers.is_empty() {
            self.ice_servers = other.ice_servers;
        }
        if self.preferred_device_label.is_none() {
            self.preferred_device_label = other.preferred_device_label;
        }
    }

    pub fn validate(&self) -> Result<AgentIdentity, ConfigError> {
        let extension = required(&self.extension, "extension")?;
        let credential = required(&self.credential, "credential")?;
        let signaling_domain = required(&self.signaling_domain, "signaling_domain")?;
        let transport_endpoint = required(&self.transport_endpoint, "transport_endpoint")?;

        if extension.contains(char::is_whitespace) || extension.contains('@') {
            return Err(ConfigError::Invalid {
                field: "extension",
                reason: format!("{:?} is not a SIP user part", extension),
            });
        }
        let endpoint = if transport_endpoint.contains("://") {
            transport_endpoint.clone()
        } else {
            // a bare host:port or sip: URI, check it as a sip URL
            format!(
                "sip://{}",
                transport_endpoint
                    .trim_start_matches("sips:")
                    .trim_start_matches("sip:")
            )
        };
        match url::Url::parse(&endpoint) {
            Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => {}
            Ok(_) => {
                return Err(ConfigError::Invalid {
                    field: "transport_endpoint",
                    reason: "missing host".to_string(),
                })
            }
            Err(e) => {
                return Err(ConfigError::Invalid {
                    field: "transport_endpoint",
                    reason: e.to_string(),
                })
            }
        }

        Ok(AgentIdentity {
            extension,
            credential,
            signaling_domain,
            transport_endpoint,
        })
    }
}

impl AgentIdentity {
    /// Address of record, `extension@domain`.
    pub fn aor(&self) -> String {
        format!("{}@{}", self.extension, self.signaling_domain)
    }

    pub fn uri(&self) -> String {
        format!("sip:{}", self.aor())
    }

    /// Registrar/outbound proxy URI derived from the transport endpoint.
    pub fn server_uri(&self) -> String {
        let endpoint = self.transport_endpoint.as_str();
        if endpoint.starts_with("sip:") || endpoint.starts_with("sips:") {
            return endpoint.to_string();
        }
        match endpoint.split_once("://") {
            Some((scheme, rest)) => {
                let hostport = rest.trim_end_matches('/');
                match scheme {
                    "udp" | "tcp" => format!("sip:{};transport={}", hostport, scheme),
                    "tls" => format!("sips:{}", hostport),
                    _ => format!("sip:{}", hostport),
                }
            }
            None => format!("sip:{}", endpoint),
        }
    }

    /// Request URI for dialing `number` within the agent's domain.
    pub fn target_uri(&self, number: &str) -> String {
        if number.starts_with("sip:") || number.starts_with("sips:") {
            number.to_string()
        } else {
            format!("sip:{}@{}", number, self.signaling_domain)
        }
    }
}
