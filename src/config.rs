use crate::error::{PkiError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for one mounted engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub crl: CrlConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tidy: TidyConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.crl.validate()?;
        self.acme.validate()?;
        self.issuance.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Revocation list configuration, persisted per mount under `config/crl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlConfig {
    /// Offset of the CRL's nextUpdate from its thisUpdate.
    #[serde(default = "default_crl_expiry", with = "humantime_serde")]
    pub expiry: Duration,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub ocsp_disable: bool,
    #[serde(default = "default_ocsp_expiry", with = "humantime_serde")]
    pub ocsp_expiry: Duration,
    #[serde(default)]
    pub auto_rebuild: bool,
    /// How long before nextUpdate an automatic full rebuild is triggered.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub auto_rebuild_grace_period: Duration,
    #[serde(default)]
    pub enable_delta: bool,
    #[serde(default = "default_delta_interval", with = "humantime_serde")]
    pub delta_rebuild_interval: Duration,
}

const fn default_crl_expiry() -> Duration {
    Duration::from_secs(72 * 3600)
}

const fn default_ocsp_expiry() -> Duration {
    Duration::from_secs(12 * 3600)
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(12 * 3600)
}

const fn default_delta_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            expiry: default_crl_expiry(),
            disable: false,
            ocsp_disable: false,
            ocsp_expiry: default_ocsp_expiry(),
            auto_rebuild: false,
            auto_rebuild_grace_period: default_grace_period(),
            enable_delta: false,
            delta_rebuild_interval: default_delta_interval(),
        }
    }
}

impl CrlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expiry.is_zero() {
            return Err(PkiError::InvalidConfig(
                "crl.expiry must be greater than 0".to_string(),
            ));
        }

        if self.auto_rebuild && self.auto_rebuild_grace_period >= self.expiry {
            return Err(PkiError::InvalidConfig(format!(
                "crl.auto_rebuild_grace_period ({}) must be shorter than crl.expiry ({})",
                humantime::format_duration(self.auto_rebuild_grace_period),
                humantime::format_duration(self.expiry)
            )));
        }

        if self.enable_delta {
            if !self.auto_rebuild {
                return Err(PkiError::InvalidConfig(
                    "crl.enable_delta requires crl.auto_rebuild".to_string(),
                ));
            }
            if self.delta_rebuild_interval.is_zero() {
                return Err(PkiError::InvalidConfig(
                    "crl.delta_rebuild_interval must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Delta lists are only produced when the automatic rebuilder runs.
    pub fn delta_active(&self) -> bool {
        self.auto_rebuild && self.enable_delta
    }
}

/// Typed request for `POST /config/crl`. Duration fields arrive as
/// Go-style duration strings and are parsed here, before any core logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrlConfigUpdate {
    pub expiry: Option<String>,
    pub disable: Option<bool>,
    pub ocsp_disable: Option<bool>,
    pub ocsp_expiry: Option<String>,
    pub auto_rebuild: Option<bool>,
    pub auto_rebuild_grace_period: Option<String>,
    pub enable_delta: Option<bool>,
    pub delta_rebuild_interval: Option<String>,
}

impl CrlConfigUpdate {
    /// Merge this update over `current`, returning the validated result.
    pub fn apply(&self, current: &CrlConfig) -> Result<CrlConfig> {
        let mut next = current.clone();

        if let Some(expiry) = &self.expiry {
            next.expiry = parse_duration_field("expiry", expiry)?;
        }
        if let Some(disable) = self.disable {
            next.disable = disable;
        }
        if let Some(ocsp_disable) = self.ocsp_disable {
            next.ocsp_disable = ocsp_disable;
        }
        if let Some(ocsp_expiry) = &self.ocsp_expiry {
            if ocsp_expiry.trim_start().starts_with('-') {
                return Err(PkiError::InvalidRequest(
                    "ocsp_expiry must be a non-negative duration".to_string(),
                ));
            }
            next.ocsp_expiry = parse_duration_field("ocsp_expiry", ocsp_expiry)?;
        }
        if let Some(auto_rebuild) = self.auto_rebuild {
            next.auto_rebuild = auto_rebuild;
        }
        if let Some(grace) = &self.auto_rebuild_grace_period {
            next.auto_rebuild_grace_period =
                parse_duration_field("auto_rebuild_grace_period", grace)?;
        }
        if let Some(enable_delta) = self.enable_delta {
            next.enable_delta = enable_delta;
        }
        if let Some(interval) = &self.delta_rebuild_interval {
            next.delta_rebuild_interval = parse_duration_field("delta_rebuild_interval", interval)?;
        }

        next.validate().map_err(|e| match e {
            PkiError::InvalidConfig(msg) => PkiError::InvalidRequest(msg),
            other => other,
        })?;
        Ok(next)
    }
}

/// Parse a Go-style duration string ("24h", "1h30m", "90s"). A bare integer
/// is taken as seconds.
pub fn parse_duration_field(field: &str, value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PkiError::InvalidRequest(format!("{} must not be empty", field)));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|e| {
        PkiError::InvalidRequest(format!("{}: invalid duration {:?}: {}", field, value, e))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    pub enabled: bool,
    /// Absolute URL prefix under which the ACME directory is served.
    pub base_url: String,
    /// Issuer reference (`default`, id or name) used to sign finalized orders.
    pub issuer_ref: String,
    #[serde(with = "humantime_serde")]
    pub nonce_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub order_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub authorization_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub certificate_ttl: Duration,
    pub terms_of_service: Option<String>,
    pub caa_identities: Vec<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://localhost:8200/v1/pki/acme".to_string(),
            issuer_ref: "default".to_string(),
            nonce_lifetime: Duration::from_secs(15 * 60),
            order_lifetime: Duration::from_secs(24 * 3600),
            authorization_lifetime: Duration::from_secs(7 * 24 * 3600),
            certificate_ttl: Duration::from_secs(90 * 24 * 3600),
            terms_of_service: None,
            caa_identities: vec![],
        }
    }
}

impl AcmeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("https://") && !self.base_url.starts_with("http://") {
            return Err(PkiError::InvalidConfig(
                "acme.base_url must be an absolute http(s) URL".to_string(),
            ));
        }
        if self.nonce_lifetime.is_zero() {
            return Err(PkiError::InvalidConfig(
                "acme.nonce_lifetime must be greater than 0".to_string(),
            ));
        }
        if self.order_lifetime.is_zero() || self.authorization_lifetime.is_zero() {
            return Err(PkiError::InvalidConfig(
                "acme order and authorization lifetimes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub root_ttl: Duration,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * 24 * 3600),
            max_ttl: Duration::from_secs(365 * 24 * 3600),
            root_ttl: Duration::from_secs(10 * 365 * 24 * 3600),
        }
    }
}

impl IssuanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() || self.default_ttl > self.max_ttl {
            return Err(PkiError::InvalidConfig(
                "issuance.default_ttl must be in (0, max_ttl]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Period of the background tick driving CRL auto-rebuild and nonce sweeps.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.tick_interval < Duration::from_millis(100) {
            return Err(PkiError::InvalidConfig(
                "scheduler.tick_interval must be at least 100ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidyConfig {
    /// Expired certificates and revocation records are kept this long past
    /// their notAfter before tidy removes them.
    #[serde(with = "humantime_serde")]
    pub safety_buffer: Duration,
    #[serde(with = "humantime_serde")]
    pub acme_safety_buffer: Duration,
}

impl Default for TidyConfig {
    fn default() -> Self {
        Self {
            safety_buffer: Duration::from_secs(72 * 3600),
            acme_safety_buffer: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
