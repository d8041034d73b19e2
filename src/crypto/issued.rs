use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rcgen::KeyPair;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::X509Certificate;

use crate::error::Error;
use crate::types::Result;

/// A signed certificate together with its private key.
///
/// Immutable once created. The PEM forms are kept exactly as produced or
/// loaded so that persisting and reloading never changes a byte.
#[derive(Clone)]
pub struct IssuedCertificate {
    key: Arc<KeyPair>,
    cert_der: Vec<u8>,
    key_pem: String,
    cert_pem: String,
}

impl IssuedCertificate {
    /// Wrap freshly signed material
    pub(crate) fn new(key: KeyPair, cert: &rcgen::Certificate) -> Self {
        Self {
            key_pem: key.serialize_pem(),
            key: Arc::new(key),
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
        }
    }

    /// Decode stored PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert_der = decode_first_cert(cert_pem)?;
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Decode(format!("Invalid private key: {}", e)))?;

        let (_, cert) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|e| Error::Decode(format!("Invalid certificate: {}", e)))?;
        if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            return Err(Error::Decode("Private key does not match certificate".into()));
        }

        Ok(Self {
            key: Arc::new(key),
            cert_der,
            key_pem: key_pem.to_string(),
            cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM-encoded private key
    pub fn key_file_contents(&self) -> &[u8] {
        self.key_pem.as_bytes()
    }

    /// PEM-encoded certificate
    pub fn cert_file_contents(&self) -> &[u8] {
        self.cert_pem.as_bytes()
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key
    pub fn private_key(&self) -> &KeyPair {
        &self.key
    }

    /// Signed certificate (DER)
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Expiry as a unix timestamp
    pub fn not_after(&self) -> Result<i64> {
        self.with_parsed(|cert| Ok(cert.validity().not_after.timestamp()))
    }

    /// Subject common name, if any
    pub fn common_name(&self) -> Result<Option<String>> {
        self.with_parsed(|cert| {
            Ok(cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string))
        })
    }

    /// DNS names and IP addresses from the SAN extension, in certificate order
    pub fn subject_alt_names(&self) -> Result<Vec<String>> {
        self.with_parsed(|cert| {
            let ext = cert
                .subject_alternative_name()
                .map_err(|e| Error::Decode(format!("Invalid SAN extension: {}", e)))?;

            let mut names = Vec::new();
            if let Some(ext) = ext {
                for name in &ext.value.general_names {
                    match name {
                        GeneralName::DNSName(dns) => names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                names.push(ip.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(names)
        })
    }

    fn with_parsed<T>(&self, f: impl FnOnce(&X509Certificate<'_>) -> Result<T>) -> Result<T> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.cert_der)
            .map_err(|e| Error::Decode(format!("Invalid certificate: {}", e)))?;
        f(&cert)
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("common_name", &self.common_name().ok().flatten())
            .field("der_len", &self.cert_der.len())
            .finish()
    }
}

/// First certificate in a PEM bundle, as DER
pub(crate) fn decode_first_cert(pem: &str) -> Result<Vec<u8>> {
    let mut reader = pem.as_bytes();
    let first = rustls_pemfile::certs(&mut reader).next();
    match first {
        Some(Ok(der)) => Ok(der.as_ref().to_vec()),
        Some(Err(e)) => Err(Error::Decode(format!("Invalid certificate PEM: {}", e))),
        None => Err(Error::Decode("No certificate found in PEM".into())),
    }
}

/// All certificates in a PEM bundle, as DER
pub(crate) fn decode_cert_chain(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|res| res.map(|der| der.as_ref().to_vec()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Decode(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Decode("No certificate found in PEM".into()));
    }
    Ok(certs)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::CertificateParams;

    fn self_signed(name: &str) -> IssuedCertificate {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        IssuedCertificate::new(key, &cert)
    }

    #[test]
    fn test_pem_round_trip_is_byte_identical() {
        let issued = self_signed("example.test");
        let loaded = IssuedCertificate::from_pem(issued.cert_pem(), issued.key_pem()).unwrap();

        assert_eq!(loaded.cert_file_contents(), issued.cert_file_contents());
        assert_eq!(loaded.key_file_contents(), issued.key_file_contents());
        assert_eq!(loaded.certificate_der(), issued.certificate_der());
    }

    #[test]
    fn test_mismatched_key_is_rejected() {
        let a = self_signed("a.test");
        let b = self_signed("b.test");
        let err = IssuedCertificate::from_pem(a.cert_pem(), b.key_pem()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_corrupt_pem_is_decode_error() {
        let issued = self_signed("example.test");
        assert!(matches!(
            IssuedCertificate::from_pem("garbage", issued.key_pem()),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            IssuedCertificate::from_pem(issued.cert_pem(), "garbage"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_subject_alt_names() {
        let issued = self_signed("example.test");
        assert_eq!(issued.subject_alt_names().unwrap(), vec!["example.test".to_string()]);
        assert!(issued.not_after().unwrap() > chrono::Utc::now().timestamp());
    }
}
