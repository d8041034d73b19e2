pub mod challenge;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod whois;

pub use challenge::{ChallengeRecord, Dns01Solver};
pub use provider::{
    challenge_hostname, normalize_domain, relative_name, DnsProvider, DnsProviderClient, DnsRecord,
    ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
pub use registry::{create_dns_provider, DnsProviderRegistry};
pub use whois::{StaticWhois, Whois, WhoisService};
