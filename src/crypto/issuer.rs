use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::crypto::issued::IssuedCertificate;
use crate::error::Error;
use crate::types::Result;

/// Subject template for issued certificates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateDesc {
    pub organization: String,
    pub country: String,
    pub province: String,
    pub city: String,
    pub street: String,
    pub zip: String,
}

impl CertificateDesc {
    /// Distinguished name with the given common name. Empty fields are omitted.
    pub fn distinguished_name(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        let fields = [
            (DnType::OrganizationName, &self.organization),
            (DnType::CountryName, &self.country),
            (DnType::StateOrProvinceName, &self.province),
            (DnType::LocalityName, &self.city),
            // streetAddress
            (DnType::CustomDnType(vec![2, 5, 4, 9]), &self.street),
            // postalCode
            (DnType::CustomDnType(vec![2, 5, 4, 17]), &self.zip),
        ];
        for (ty, value) in fields {
            if !value.is_empty() {
                dn.push(ty, value.as_str());
            }
        }
        dn.push(DnType::CommonName, common_name);
        dn
    }
}

/// Validity periods for each level of the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub root_days: u32,
    pub intermediate_days: u32,
    pub leaf_days: u32,
}

impl Default for Validity {
    fn default() -> Self {
        Self {
            root_days: 3650,
            intermediate_days: 1825,
            leaf_days: 365,
        }
    }
}

/// Identifier of a node in an [`IssuerRegistry`], derived from its certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IssuerId(u64);

impl IssuerId {
    fn of(cert_der: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        cert_der.hash(&mut hasher);
        IssuerId(hasher.finish())
    }
}

impl fmt::Display for IssuerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct IssuerNode {
    id: IssuerId,
    parent: Option<IssuerId>,
    cert: IssuedCertificate,
    signer: rcgen::Certificate,
    subject: DistinguishedName,
}

/// Shared table of issuer nodes; children refer to parents by id
pub struct IssuerRegistry {
    validity: Validity,
    nodes: RwLock<HashMap<IssuerId, Arc<IssuerNode>>>,
}

impl IssuerRegistry {
    pub fn new(validity: Validity) -> Self {
        Self {
            validity,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    /// Number of known issuers
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn get(&self, id: IssuerId) -> Option<Arc<IssuerNode>> {
        self.nodes.read().get(&id).cloned()
    }

    fn insert(&self, node: IssuerNode) -> Arc<IssuerNode> {
        self.nodes
            .write()
            .entry(node.id)
            .or_insert_with(|| Arc::new(node))
            .clone()
    }
}

/// A node of the CA hierarchy able to sign certificates
#[derive(Clone)]
pub struct CertificateIssuer {
    node: Arc<IssuerNode>,
    registry: Arc<IssuerRegistry>,
}

impl CertificateIssuer {
    /// Create a new self-signed root
    pub(crate) fn new_root(
        registry: Arc<IssuerRegistry>,
        common_name: &str,
        desc: &CertificateDesc,
    ) -> Result<Self> {
        let key = KeyPair::generate()?;
        let params = ca_params(desc.distinguished_name(common_name), registry.validity.root_days);

        let subject = params.distinguished_name.clone();
        let signer = params.self_signed(&key)?;
        let cert = IssuedCertificate::new(key, &signer);

        debug!(cn = common_name, "Created root issuer");
        Ok(Self::register(registry, None, cert, signer, subject))
    }

    /// Rebuild an issuer from stored material.
    ///
    /// The caller is responsible for validating `cert` against `parent`.
    pub(crate) fn from_issued(
        registry: Arc<IssuerRegistry>,
        cert: IssuedCertificate,
        parent: Option<&CertificateIssuer>,
    ) -> Result<Self> {
        let params = CertificateParams::from_ca_cert_pem(cert.cert_pem())
            .map_err(|e| Error::Decode(format!("Invalid CA certificate: {}", e)))?;
        let subject = params.distinguished_name.clone();
        let signer = params.self_signed(cert.private_key())?;

        Ok(Self::register(
            registry,
            parent.map(|p| p.node.id),
            cert,
            signer,
            subject,
        ))
    }

    fn register(
        registry: Arc<IssuerRegistry>,
        parent: Option<IssuerId>,
        cert: IssuedCertificate,
        signer: rcgen::Certificate,
        subject: DistinguishedName,
    ) -> Self {
        let node = registry.insert(IssuerNode {
            id: IssuerId::of(cert.certificate_der()),
            parent,
            cert,
            signer,
            subject,
        });
        Self { node, registry }
    }

    pub fn id(&self) -> IssuerId {
        self.node.id
    }

    /// This issuer's own certificate and key
    pub fn certificate(&self) -> &IssuedCertificate {
        &self.node.cert
    }

    /// The issuer that signed this one; `None` for a root
    pub fn parent(&self) -> Option<CertificateIssuer> {
        let parent_id = self.node.parent?;
        self.registry.get(parent_id).map(|node| CertificateIssuer {
            node,
            registry: self.registry.clone(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.node.parent.is_none()
    }

    /// Certificates from this issuer up to the root
    pub fn chain(&self) -> Vec<IssuedCertificate> {
        let mut chain = vec![self.node.cert.clone()];
        let mut current = self.parent();
        while let Some(issuer) = current {
            chain.push(issuer.node.cert.clone());
            current = issuer.parent();
        }
        chain
    }

    /// Concatenated PEM of [`Self::chain`]
    pub fn chain_pem(&self) -> String {
        self.chain().iter().map(|c| c.cert_pem()).collect::<Vec<_>>().concat()
    }

    /// Mint an intermediate CA signed by this issuer
    pub fn issue_inter_cert(&self, common_name: &str) -> Result<CertificateIssuer> {
        let key = KeyPair::generate()?;
        let mut params = ca_params(
            self.child_subject(common_name),
            self.registry.validity.intermediate_days,
        );
        params.not_after = self.clamp_not_after(self.registry.validity.intermediate_days)?;
        params.use_authority_key_identifier_extension = true;

        let subject = params.distinguished_name.clone();
        let signer = params.signed_by(&key, &self.node.signer, self.node.cert.private_key())?;
        let cert = IssuedCertificate::new(key, &signer);

        debug!(cn = common_name, parent = %self.node.id, "Issued intermediate");
        Ok(Self::register(
            self.registry.clone(),
            Some(self.node.id),
            cert,
            signer,
            subject,
        ))
    }

    /// Issue a client certificate and a PKCS#12 bundle holding key, certificate
    /// and this issuer's certificate
    pub fn issue_client_cert(
        &self,
        common_name: &str,
        password: &str,
    ) -> Result<(IssuedCertificate, Vec<u8>)> {
        let mut params = self.leaf_params(common_name)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let issued = self.sign_leaf(params)?;

        let pfx = p12::PFX::new(
            issued.certificate_der(),
            &issued.private_key().serialize_der(),
            Some(self.node.cert.certificate_der()),
            password,
            common_name,
        )
        .ok_or_else(|| Error::Crypto("Failed to build PKCS#12 bundle".into()))?;

        debug!(cn = common_name, issuer = %self.node.id, "Issued client certificate");
        Ok((issued, pfx.to_der()))
    }

    /// Issue a server certificate whose SAN is the union of `domains` and `ip_addresses`
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        domains: &[String],
        ip_addresses: &[IpAddr],
    ) -> Result<IssuedCertificate> {
        let mut seen = HashSet::new();
        let mut sans = Vec::new();
        for domain in domains {
            if seen.insert(domain.clone()) {
                let name = Ia5String::try_from(domain.clone()).map_err(|e| {
                    Error::InvalidRequest(format!("Invalid domain '{}': {}", domain, e))
                })?;
                sans.push(SanType::DnsName(name));
            }
        }
        for ip in ip_addresses {
            if seen.insert(ip.to_string()) {
                sans.push(SanType::IpAddress(*ip));
            }
        }
        if sans.is_empty() {
            return Err(Error::Config(
                "Server certificate needs at least one domain or IP address".into(),
            ));
        }

        let mut params = self.leaf_params(common_name)?;
        params.subject_alt_names = sans;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let issued = self.sign_leaf(params)?;
        debug!(cn = common_name, issuer = %self.node.id, "Issued server certificate");
        Ok(issued)
    }

    fn leaf_params(&self, common_name: &str) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.child_subject(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());
        params.not_before = not_before();
        params.not_after = self.clamp_not_after(self.registry.validity.leaf_days)?;
        Ok(params)
    }

    fn sign_leaf(&self, params: CertificateParams) -> Result<IssuedCertificate> {
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.node.signer, self.node.cert.private_key())?;
        Ok(IssuedCertificate::new(key, &cert))
    }

    fn child_subject(&self, common_name: &str) -> DistinguishedName {
        let mut dn = self.node.subject.clone();
        dn.remove(DnType::CommonName);
        dn.push(DnType::CommonName, common_name);
        dn
    }

    // Children never outlive their issuer.
    fn clamp_not_after(&self, days: u32) -> Result<OffsetDateTime> {
        let issuer_expiry = OffsetDateTime::from_unix_timestamp(self.node.cert.not_after()?)
            .map_err(|e| Error::Crypto(format!("Invalid issuer expiry: {}", e)))?;
        Ok(days_from_now(days).min(issuer_expiry))
    }
}

impl fmt::Debug for CertificateIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIssuer")
            .field("id", &self.node.id)
            .field("parent", &self.node.parent)
            .field("certificate", &self.node.cert)
            .finish()
    }
}

fn ca_params(subject: DistinguishedName, days: u32) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial());
    params.not_before = not_before();
    params.not_after = days_from_now(days);
    params
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // positive, no leading zero octet
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from(bytes.to_vec())
}

fn not_before() -> OffsetDateTime {
    OffsetDateTime::now_utc() - time::Duration::minutes(5)
}

fn days_from_now(days: u32) -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::days(i64::from(days))
}
