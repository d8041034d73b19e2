pub mod settings;

pub use settings::{
    AcmeConfig, BackoffConfig, CertificateConfig, DnsConfig, DnsProviderConfig, DnsProviderKind,
    DynDnsConfig, GeneralConfig, Settings, StorageBackend, StorageConfig, TelemetryConfig,
    WhoisConfig, LETSENCRYPT_PRODUCTION, LOCAL_ACME_DIRECTORY,
};
