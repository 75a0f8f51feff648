//! Certificate, key and credential bundle types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Subject Alternative Name types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    /// DNS name.
    Dns(String),
    /// IP address.
    Ip(std::net::IpAddr),
    /// Email address.
    Email(String),
    /// URI.
    Uri(String),
}

impl SubjectAltName {
    /// Classifies a free-form alternate name as requested in a profile.
    ///
    /// IP literals become [`SubjectAltName::Ip`], names containing `://`
    /// become URIs, names containing `@` become emails, everything else is
    /// treated as a DNS name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            Self::Ip(ip)
        } else if name.contains("://") {
            Self::Uri(name.to_string())
        } else if name.contains('@') {
            Self::Email(name.to_string())
        } else {
            Self::Dns(name.to_string())
        }
    }
}

/// A DER-encoded X.509 certificate with the metadata this crate relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: String,
    issuer: String,
    serial_number: String,
    san: Vec<SubjectAltName>,
}

impl Certificate {
    /// Creates a certificate from raw DER bytes and already-known metadata.
    #[must_use]
    pub const fn new(
        der: Vec<u8>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        subject: String,
        issuer: String,
        serial_number: String,
    ) -> Self {
        Self {
            der,
            not_before,
            not_after,
            subject,
            issuer,
            serial_number,
            san: Vec::new(),
        }
    }

    /// Parses a certificate from DER-encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if parsing fails.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Decode(format!("failed to parse certificate: {e}")))?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::Decode("invalid not_before timestamp".into()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Decode("invalid not_after timestamp".into()))?;

        let subject = display_name(cert.subject());
        let issuer = display_name(cert.issuer());
        let serial_number = cert.raw_serial_as_string();
        let san = extract_san(&cert);

        Ok(Self {
            der: der.to_vec(),
            not_before,
            not_after,
            subject,
            issuer,
            serial_number,
            san,
        })
    }

    /// Parses the first `CERTIFICATE` block of a PEM document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the PEM is malformed, carries another
    /// label, or holds an unparsable certificate.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| Error::Decode(format!("invalid certificate PEM: {e}")))?;

        if block.label != "CERTIFICATE" {
            return Err(Error::Decode(format!(
                "expected CERTIFICATE PEM block, found '{}'",
                block.label
            )));
        }

        Self::from_der(&block.contents)
    }

    /// Returns the DER-encoded certificate bytes.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    #[must_use]
    pub fn pem(&self) -> String {
        encode_pem("CERTIFICATE", &self.der)
    }

    /// Returns the certificate validity start time.
    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Returns the certificate validity end time.
    #[must_use]
    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns the subject common name, or the full subject DN if it has
    /// no CN.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the issuer common name, or the full issuer DN if it has no
    /// CN.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the serial number as colon-separated hex.
    #[must_use]
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Returns the subject alternative names.
    #[must_use]
    pub fn san(&self) -> &[SubjectAltName] {
        &self.san
    }
}

/// Returns the common name of an X.509 name, or the whole distinguished
/// name when it carries no readable CN.
fn display_name(name: &x509_parser::x509::X509Name) -> String {
    name.iter_common_name()
        .find_map(|cn| cn.as_str().ok())
        .map_or_else(|| name.to_string(), String::from)
}

/// Reads the key family from the `privateKeyAlgorithm` of a PKCS#8
/// `PrivateKeyInfo` without interpreting the key itself.
fn pkcs8_key_algorithm(der: &[u8]) -> Result<KeyAlgorithm> {
    use x509_parser::der_parser::der::parse_der;

    let malformed = |reason: &str| Error::Decode(format!("failed to parse private key: {reason}"));

    let (rest, info) = parse_der(der).map_err(|e| malformed(&e.to_string()))?;
    if !rest.is_empty() {
        return Err(malformed("trailing data after PKCS#8 structure"));
    }

    let fields = info
        .as_sequence()
        .map_err(|_| malformed("not a PKCS#8 structure"))?;
    if fields.get(2).and_then(|key| key.as_slice().ok()).is_none() {
        return Err(malformed("missing private key octets"));
    }

    let oid = fields
        .get(1)
        .and_then(|identifier| identifier.as_sequence().ok())
        .and_then(|identifier| identifier.first())
        .and_then(|algorithm| algorithm.as_oid().ok())
        .ok_or_else(|| malformed("missing key algorithm identifier"))?
        .to_id_string();

    KeyAlgorithm::from_oid(&oid)
        .ok_or_else(|| Error::Decode(format!("unsupported private key algorithm {oid}")))
}

/// Extracts SANs from a certificate.
fn extract_san(cert: &x509_parser::certificate::X509Certificate) -> Vec<SubjectAltName> {
    use x509_parser::extensions::GeneralName;

    let mut sans = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(SubjectAltName::Dns((*dns).to_string())),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = parse_ip_bytes(bytes) {
                        sans.push(SubjectAltName::Ip(ip));
                    }
                }
                GeneralName::RFC822Name(email) => {
                    sans.push(SubjectAltName::Email((*email).to_string()));
                }
                GeneralName::URI(uri) => sans.push(SubjectAltName::Uri((*uri).to_string())),
                _ => {}
            }
        }
    }

    sans
}

fn parse_ip_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Private key algorithm families a backend may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// RSA.
    Rsa,
    /// ECDSA over a NIST curve.
    Ec,
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    /// Returns the lowercase name used by PKI backends.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ec => "ec",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Maps a PKCS#8 `privateKeyAlgorithm` OID to its key family.
    fn from_oid(oid: &str) -> Option<Self> {
        match oid {
            "1.2.840.113549.1.1.1" => Some(Self::Rsa),
            "1.2.840.10045.2.1" => Some(Self::Ec),
            "1.3.101.112" => Some(Self::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ec" | "ecdsa" => Ok(Self::Ec),
            "ed25519" => Ok(Self::Ed25519),
            other => Err(Error::Decode(format!("unsupported key type '{other}'"))),
        }
    }
}

/// A PKCS#8 private key with secure memory handling.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    der: Vec<u8>,
    #[zeroize(skip)]
    algorithm: KeyAlgorithm,
}

impl PrivateKey {
    /// Decodes PKCS#8 DER key material and checks it against the algorithm
    /// the backend reported for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the bytes are not a usable PKCS#8 key or
    /// the key family differs from `expected`.
    pub fn from_pkcs8_der(der: Vec<u8>, expected: KeyAlgorithm) -> Result<Self> {
        let actual = pkcs8_key_algorithm(&der)?;

        if actual != expected {
            return Err(Error::Decode(format!(
                "backend reported a {expected} key but the material is {actual}"
            )));
        }

        Ok(Self {
            der,
            algorithm: actual,
        })
    }

    /// Returns the DER-encoded PKCS#8 bytes.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the key algorithm family.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Returns the PEM-encoded PKCS#8 private key.
    #[must_use]
    pub fn pem(&self) -> String {
        encode_pem("PRIVATE KEY", &self.der)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .field("der", &"[REDACTED]")
            .finish()
    }
}

impl Clone for PrivateKey {
    fn clone(&self) -> Self {
        Self {
            der: self.der.clone(),
            algorithm: self.algorithm,
        }
    }
}

/// The immutable result of one issuance cycle for one profile.
///
/// The client chain is never empty and `expires_at` is always the leaf's
/// not-after time.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    client_chain: Vec<Certificate>,
    private_key: PrivateKey,
    trusted_ca_chain: Vec<Certificate>,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl CredentialBundle {
    /// Assembles a bundle, deriving the expiry from the leaf certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the client chain is empty.
    pub fn new(
        client_chain: Vec<Certificate>,
        private_key: PrivateKey,
        trusted_ca_chain: Vec<Certificate>,
    ) -> Result<Self> {
        let expires_at = client_chain
            .first()
            .map(Certificate::not_after)
            .ok_or_else(|| Error::Decode("client certificate chain is empty".into()))?;

        Ok(Self {
            client_chain,
            private_key,
            trusted_ca_chain,
            expires_at,
            issued_at: Utc::now(),
        })
    }

    /// Returns the client certificate chain, leaf first.
    #[must_use]
    pub fn client_chain(&self) -> &[Certificate] {
        &self.client_chain
    }

    /// Returns the leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &Certificate {
        &self.client_chain[0]
    }

    /// Returns the private key matching the leaf.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Returns the CA certificates peers are trusted through.
    #[must_use]
    pub fn trusted_ca_chain(&self) -> &[Certificate] {
        &self.trusted_ca_chain
    }

    /// Returns when the leaf certificate expires.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns when this bundle was assembled.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Returns true once the leaf certificate has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// Returns the validity left on the leaf, zero once expired.
    #[must_use]
    pub fn remaining_validity(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns the client chain as concatenated PEM blocks.
    #[must_use]
    pub fn client_chain_pem(&self) -> String {
        self.client_chain.iter().map(Certificate::pem).collect()
    }

    /// Returns the trusted CA chain as concatenated PEM blocks.
    #[must_use]
    pub fn trusted_ca_pem(&self) -> String {
        self.trusted_ca_chain.iter().map(Certificate::pem).collect()
    }
}

/// Wraps DER bytes in a PEM block with 64-column base64 lines.
fn encode_pem(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        b64.as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
