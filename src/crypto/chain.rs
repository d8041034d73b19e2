use x509_parser::prelude::X509Certificate;

use crate::error::Error;
use crate::types::Result;

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| Error::Decode(format!("Invalid certificate: {}", e)))
}

fn subject_of(cert: &X509Certificate<'_>) -> String {
    cert.subject().to_string()
}

/// Check that `child` was issued by `issuer`.
///
/// Requires the issuer name to match the issuer's subject, the issuer to be a
/// CA, a valid signature under the issuer's key and both validity windows to
/// cover the current time.
pub fn verify_link(child_der: &[u8], issuer_der: &[u8]) -> Result<()> {
    let child = parse(child_der)?;
    let issuer = parse(issuer_der)?;

    if child.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(Error::ChainValidation(format!(
            "'{}' is not issued by '{}'",
            subject_of(&child),
            subject_of(&issuer)
        )));
    }
    if !issuer.is_ca() {
        return Err(Error::ChainValidation(format!(
            "'{}' is not a CA certificate",
            subject_of(&issuer)
        )));
    }
    child
        .verify_signature(Some(issuer.public_key()))
        .map_err(|e| {
            Error::ChainValidation(format!(
                "Signature of '{}' does not verify: {}",
                subject_of(&child),
                e
            ))
        })?;

    check_validity(&child)?;
    check_validity(&issuer)
}

/// Check that `der` is a valid self-signed CA certificate
pub fn verify_root(der: &[u8]) -> Result<()> {
    let root = parse(der)?;

    if root.issuer().as_raw() != root.subject().as_raw() {
        return Err(Error::ChainValidation(format!(
            "'{}' is not self-issued",
            subject_of(&root)
        )));
    }
    if !root.is_ca() {
        return Err(Error::ChainValidation(format!(
            "'{}' is not a CA certificate",
            subject_of(&root)
        )));
    }
    root.verify_signature(None).map_err(|e| {
        Error::ChainValidation(format!("Root self-signature does not verify: {}", e))
    })?;

    check_validity(&root)
}

/// Validate a leaf against its issuers, ordered from the direct issuer up to the root
pub fn verify_chain(leaf_der: &[u8], issuers: &[&[u8]]) -> Result<()> {
    let root = issuers
        .last()
        .ok_or_else(|| Error::ChainValidation("Empty issuer chain".into()))?;

    let mut child = leaf_der;
    for issuer in issuers {
        verify_link(child, issuer)?;
        child = *issuer;
    }

    verify_root(root)
}

fn check_validity(cert: &X509Certificate<'_>) -> Result<()> {
    if !cert.validity().is_valid() {
        return Err(Error::ChainValidation(format!(
            "'{}' is outside its validity window",
            subject_of(cert)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn ca(cn: &str) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        (params.self_signed(&key).unwrap(), key)
    }

    #[test]
    fn test_root_and_leaf() {
        let (root, root_key) = ca("Root");
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["example.test".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &root, &root_key)
            .unwrap();

        assert!(verify_root(root.der()).is_ok());
        assert!(verify_chain(leaf.der(), &[&root.der()[..]]).is_ok());
    }

    #[test]
    fn test_wrong_issuer_fails() {
        let (root, root_key) = ca("Root");
        let (other, _) = ca("Other");
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["example.test".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &root, &root_key)
            .unwrap();

        let err = verify_chain(leaf.der(), &[&other.der()[..]]).unwrap_err();
        assert!(matches!(err, Error::ChainValidation(_)));
    }

    #[test]
    fn test_leaf_is_not_a_root() {
        let key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["example.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        assert!(verify_root(leaf.der()).is_err());
    }

    #[test]
    fn test_empty_chain_fails() {
        let (root, _) = ca("Root");
        assert!(verify_chain(root.der(), &[]).is_err());
    }
}
