pub mod chain;
pub mod issued;
pub mod issuer;
pub mod service;

pub use chain::{verify_chain, verify_link, verify_root};
pub use issued::IssuedCertificate;
pub use issuer::{CertificateDesc, CertificateIssuer, IssuerId, IssuerRegistry, Validity};
pub use service::CertificateIssueService;
