pub mod hetzner;
pub mod memory;
pub mod webhook;

pub use hetzner::HetznerProvider;
pub use memory::{MemoryDnsClient, MemoryDnsProvider};
pub use webhook::WebhookProvider;
