pub mod dyndns;
pub mod renewal;

pub use dyndns::{ensure_custom, DynDnsService};
pub use renewal::{RenewalController, RenewalReport};
