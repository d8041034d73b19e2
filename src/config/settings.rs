use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::CertificateDesc;
use crate::dns::Whois;
use crate::error::Error;
use crate::types::Result;
use crate::utils::backoff::Backoff;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// `acme.directory_url` value selecting the in-process directory
pub const LOCAL_ACME_DIRECTORY: &str = "local";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Certificate issuance configuration
    #[serde(default)]
    pub certificate: CertificateConfig,

    /// ACME configuration
    #[serde(default)]
    pub acme: AcmeConfig,

    /// DNS provider configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// Static WHOIS facts
    #[serde(default)]
    pub whois: WhoisConfig,

    /// Repository backend
    #[serde(default)]
    pub storage: StorageConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    pub app_name: String,

    /// Log level
    pub log_level: String,

    /// Data directory
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: "zonecert".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable structured (JSON) logging
    pub structured_logging: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            structured_logging: false,
        }
    }
}

/// Certificate issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Subject template for new issuers
    pub desc: Option<CertificateDesc>,

    /// Root CA validity (days)
    pub root_validity_days: u32,

    /// Intermediate CA validity (days)
    pub intermediate_validity_days: u32,

    /// Leaf certificate validity (days)
    pub leaf_validity_days: u32,

    /// Renew when fewer than this many days remain
    pub renew_before_days: i64,

    /// Interval between renewal checks (seconds)
    pub check_interval_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            desc: None,
            root_validity_days: 3650,
            intermediate_validity_days: 1825,
            leaf_validity_days: 365,
            renew_before_days: 30,
            check_interval_secs: 3600,
        }
    }
}

impl CertificateConfig {
    /// Validity periods in the order root, intermediate, leaf
    pub fn validity(&self) -> crate::crypto::Validity {
        crate::crypto::Validity {
            root_days: self.root_validity_days,
            intermediate_days: self.intermediate_validity_days,
            leaf_days: self.leaf_validity_days,
        }
    }
}

/// Bounded exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Largest single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Delay multiplier
    pub factor: u32,

    /// Total ceiling (seconds)
    pub timeout_secs: u64,
}

impl BackoffConfig {
    fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            factor: 2,
            timeout_secs,
        }
    }

    /// Build the runtime backoff policy
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.factor,
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME directory URL, or `local` for the in-process directory
    pub directory_url: String,

    /// Account email used when a zone does not name one
    pub email: Option<String>,

    /// DNS propagation polling
    pub propagation: BackoffConfig,

    /// Order validation polling
    pub validation: BackoffConfig,
}

impl AcmeConfig {
    /// Whether orders are served by the in-process directory
    pub fn is_local(&self) -> bool {
        self.directory_url == LOCAL_ACME_DIRECTORY
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            email: None,
            propagation: BackoffConfig::with_timeout(120),
            validation: BackoffConfig::with_timeout(180),
        }
    }
}

/// Supported DNS provider implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    /// Hetzner DNS API
    Hetzner,
    /// Generic HTTP webhook
    Webhook,
    /// In-process record table
    Memory,
}

/// One registered DNS provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsProviderConfig {
    /// Registry name
    pub name: String,

    /// Implementation
    pub kind: DnsProviderKind,

    /// API token
    #[serde(default)]
    pub token: Option<String>,

    /// API base URL override
    #[serde(default)]
    pub api_url: Option<String>,

    /// Name server substrings this provider claims
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// Request timeout (seconds)
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_api_timeout() -> u64 {
    30
}

/// Dynamic DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynDnsConfig {
    /// Keep address records in sync
    pub enabled: bool,

    /// Sub-domains to publish in every zone besides the apex
    pub sub_domains: Vec<String>,

    /// Sync interval (seconds)
    pub interval_secs: u64,
}

impl Default for DynDnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sub_domains: Vec::new(),
            interval_secs: 300,
        }
    }
}

/// DNS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Providers in detection order
    #[serde(default)]
    pub providers: Vec<DnsProviderConfig>,

    /// Dynamic DNS
    #[serde(default)]
    pub dyndns: DynDnsConfig,
}

impl DnsConfig {
    /// API token configured for a provider
    pub fn token_for(&self, provider: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|p| p.name == provider)
            .and_then(|p| p.token.as_deref())
    }
}

/// Static WHOIS entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhoisConfig {
    /// Known domains
    #[serde(default)]
    pub entries: Vec<Whois>,
}

/// Repository backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory
    Memory,
    /// JSON files on disk
    File,
}

/// Repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,

    /// Directory for the file backend (defaults to `<data_dir>/store`)
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            telemetry: TelemetryConfig::default(),
            certificate: CertificateConfig::default(),
            acme: AcmeConfig::default(),
            dns: DnsConfig::default(),
            whois: WhoisConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from environment variables and configuration files
    pub fn load() -> Result<Self> {
        use config::{Config, Environment, File};
        use std::env;

        let mut builder = Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add configuration from files
        if let Ok(config_path) = env::var("ZONECERT_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path));
        } else {
            builder = builder.add_source(File::with_name("config/default").required(false));

            let env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());
            builder = builder.add_source(File::with_name(&format!("config/{}", env)).required(false));
        }

        // Add environment variables
        builder = builder.add_source(Environment::with_prefix("ZONECERT").separator("__"));

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Directory used by the file repository backend
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("store"))
    }

    /// Check if configuration is valid
    pub fn validate(&self) -> Result<()> {
        if !self.acme.is_local() {
            url::Url::parse(&self.acme.directory_url)?;
        }

        if self.certificate.leaf_validity_days == 0 {
            return Err(Error::Config("Leaf validity must be at least one day".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.dns.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "DNS provider '{}' is configured twice",
                    provider.name
                )));
            }
            if provider.kind == DnsProviderKind::Hetzner && provider.token.is_none() {
                return Err(Error::Config(format!(
                    "DNS provider '{}' requires a token",
                    provider.name
                )));
            }
            if provider.kind == DnsProviderKind::Webhook && provider.api_url.is_none() {
                return Err(Error::Config(format!(
                    "DNS provider '{}' requires an api_url",
                    provider.name
                )));
            }
        }

        for backoff in [&self.acme.propagation, &self.acme.validation] {
            if backoff.timeout_secs == 0 || backoff.factor == 0 {
                return Err(Error::Config("ACME polling needs a non-zero timeout and factor".into()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage_dir(), PathBuf::from("./data/store"));
        assert_eq!(settings.acme.validation.timeout_secs, 180);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut settings = Settings::default();
        let provider = DnsProviderConfig {
            name: "local".into(),
            kind: DnsProviderKind::Memory,
            token: None,
            api_url: None,
            nameservers: vec!["ns.local".into()],
            timeout_secs: 30,
        };
        settings.dns.providers = vec![provider.clone(), provider];
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_local_directory_skips_url_check() {
        let mut settings = Settings::default();
        assert!(!settings.acme.is_local());

        settings.acme.directory_url = LOCAL_ACME_DIRECTORY.into();
        assert!(settings.acme.is_local());
        assert!(settings.validate().is_ok());

        settings.acme.directory_url = "not a url".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_hetzner_requires_token() {
        let mut settings = Settings::default();
        settings.dns.providers.push(DnsProviderConfig {
            name: "hetzner".into(),
            kind: DnsProviderKind::Hetzner,
            token: None,
            api_url: None,
            nameservers: vec![],
            timeout_secs: 30,
        });
        assert!(settings.validate().is_err());

        settings.dns.providers[0].token = Some("secret".into());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.dns.token_for("hetzner"), Some("secret"));
    }

    #[test]
    fn test_parse_yaml_settings() {
        let yaml = r#"
general:
  app_name: "zonecert"
  log_level: "debug"
  data_dir: "/var/lib/zonecert"
certificate:
  desc:
    organization: "Example Org"
    country: "US"
    province: "CA"
    city: "San Francisco"
    street: "1 Market St"
    zip: "94105"
  root_validity_days: 3650
  intermediate_validity_days: 1825
  leaf_validity_days: 90
  renew_before_days: 20
  check_interval_secs: 600
dns:
  providers:
    - name: "hetzner"
      kind: "hetzner"
      token: "abc"
      nameservers: ["hetzner.com"]
storage:
  backend: "memory"
  path: null
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.general.log_level, "debug");
        assert_eq!(settings.certificate.leaf_validity_days, 90);
        assert_eq!(settings.dns.providers[0].kind, DnsProviderKind::Hetzner);
        assert_eq!(settings.dns.providers[0].timeout_secs, 30);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(
            settings.certificate.desc.as_ref().map(|d| d.organization.as_str()),
            Some("Example Org")
        );
        assert!(settings.validate().is_ok());
    }
}
