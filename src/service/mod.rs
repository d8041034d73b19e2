pub mod cert_service;
pub mod command;

pub use cert_service::{AcmeUser, CertificateService};
pub use command::AdminCommand;
