//! Boundary with the certificate-authority backend.
//!
//! The backend is an external collaborator: a PKI secrets engine reached over
//! the network, or the in-process [`LocalCertificateAuthority`] used for
//! development and tests. Responses carry certificate and key material in
//! the textual form PKI engines return, and [`CertificateData`] and
//! [`PrivateKeyData`] decode it into typed values.
//!
//! [`LocalCertificateAuthority`]: crate::ca::LocalCertificateAuthority

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Certificate, KeyAlgorithm, PrivateKey};

/// Boxed future returned by [`IssuanceBackend`] operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Encoding of certificate and key material in backend responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// PEM text blocks.
    #[default]
    Pem,
    /// Base64-encoded DER.
    Der,
}

/// Private key container format requested from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivateKeyEncoding {
    /// PKCS#8 `PrivateKeyInfo`.
    #[default]
    Pkcs8,
    /// Algorithm-specific encoding (PKCS#1 for RSA, SEC1 for EC).
    Der,
}

/// Certificate material as returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateData {
    /// Encoding of `data`.
    pub format: DataFormat,
    /// PEM text or base64 DER.
    pub data: String,
}

impl CertificateData {
    /// Wraps a PEM certificate.
    #[must_use]
    pub fn pem(data: impl Into<String>) -> Self {
        Self {
            format: DataFormat::Pem,
            data: data.into(),
        }
    }

    /// Wraps base64-encoded DER.
    #[must_use]
    pub fn der_base64(data: impl Into<String>) -> Self {
        Self {
            format: DataFormat::Der,
            data: data.into(),
        }
    }

    /// Encodes a certificate in the requested format.
    #[must_use]
    pub fn encode(cert: &Certificate, format: DataFormat) -> Self {
        match format {
            DataFormat::Pem => Self::pem(cert.pem()),
            DataFormat::Der => {
                Self::der_base64(base64::engine::general_purpose::STANDARD.encode(cert.der()))
            }
        }
    }

    /// Decodes the material into a parsed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the encoding or the certificate is invalid.
    pub fn decode(&self) -> Result<Certificate> {
        match self.format {
            DataFormat::Pem => Certificate::from_pem(&self.data),
            DataFormat::Der => Certificate::from_der(&decode_base64(&self.data)?),
        }
    }
}

/// Private key material as returned by a backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateKeyData {
    /// Encoding of `data`.
    pub format: DataFormat,
    /// Container format of the key.
    pub encoding: PrivateKeyEncoding,
    /// PEM text or base64 DER.
    pub data: String,
}

impl PrivateKeyData {
    /// Decodes the material into a private key of the reported algorithm.
    ///
    /// Only PKCS#8 keys are accepted; that is the encoding this crate asks
    /// backends for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for unsupported encodings, malformed
    /// material, or a key whose algorithm differs from `reported`.
    pub fn decode(&self, reported: KeyAlgorithm) -> Result<PrivateKey> {
        if self.encoding != PrivateKeyEncoding::Pkcs8 {
            return Err(Error::Decode(
                "only PKCS#8 private keys are supported".into(),
            ));
        }

        let der = match self.format {
            DataFormat::Pem => {
                let (_, block) = x509_parser::pem::parse_x509_pem(self.data.as_bytes())
                    .map_err(|e| Error::Decode(format!("invalid private key PEM: {e}")))?;
                if block.label != "PRIVATE KEY" {
                    return Err(Error::Decode(format!(
                        "expected PRIVATE KEY PEM block, found '{}'",
                        block.label
                    )));
                }
                block.contents
            }
            DataFormat::Der => decode_base64(&self.data)?,
        };

        PrivateKey::from_pkcs8_der(der, reported)
    }
}

impl std::fmt::Debug for PrivateKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyData")
            .field("format", &self.format)
            .field("encoding", &self.encoding)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| Error::Decode(format!("invalid base64 DER: {e}")))
}

/// Options for a leaf certificate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateCertificateOptions {
    /// Encoding of the returned material.
    pub format: DataFormat,
    /// Container format of the returned private key.
    pub private_key_encoding: PrivateKeyEncoding,
    /// Subject common name.
    pub common_name: String,
    /// Subject alternative names.
    pub subject_alternative_names: Vec<String>,
    /// Requested lifetime; the backend may clamp it.
    pub time_to_live: Option<Duration>,
}

impl GenerateCertificateOptions {
    /// Creates options for `common_name` with PEM output and PKCS#8 keys.
    #[must_use]
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            format: DataFormat::Pem,
            private_key_encoding: PrivateKeyEncoding::Pkcs8,
            common_name: common_name.into(),
            subject_alternative_names: Vec::new(),
            time_to_live: None,
        }
    }

    /// Sets the subject alternative names.
    #[must_use]
    pub fn subject_alternative_names(mut self, names: Vec<String>) -> Self {
        self.subject_alternative_names = names;
        self
    }

    /// Sets the requested lifetime.
    #[must_use]
    pub const fn time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub const fn format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }
}

/// A freshly generated leaf certificate and key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCertificate {
    /// The leaf certificate.
    pub certificate: CertificateData,
    /// The CA that signed the leaf.
    pub issuing_ca: CertificateData,
    /// Full chain above the leaf, issuing CA first, when the backend
    /// provides one.
    pub ca_chain: Option<Vec<CertificateData>>,
    /// The leaf's private key.
    pub private_key: PrivateKeyData,
    /// Algorithm family of `private_key`.
    pub private_key_type: KeyAlgorithm,
    /// Serial number of the leaf.
    pub serial_number: String,
}

/// A certificate-authority backend able to issue leaf certificates.
///
/// Every call addresses a `mount`, the location of one PKI engine inside the
/// backend. Implementations must be safe to call concurrently for different
/// profiles.
pub trait IssuanceBackend: Send + Sync {
    /// Fetches the issuing CA certificate of a mount.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issuance`] if the backend cannot serve the request.
    fn certificate_authority<'a>(&'a self, mount: &'a str) -> BackendFuture<'a, CertificateData>;

    /// Fetches the chain above the issuing CA of a mount.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issuance`] if the backend cannot serve the request.
    fn certificate_authority_chain<'a>(
        &'a self,
        mount: &'a str,
    ) -> BackendFuture<'a, Vec<CertificateData>>;

    /// Generates a new leaf certificate and private key for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issuance`] on any backend-side rejection: unknown
    /// role, policy denial, or transport failure.
    fn generate_certificate<'a>(
        &'a self,
        mount: &'a str,
        role: &'a str,
        options: &'a GenerateCertificateOptions,
    ) -> BackendFuture<'a, GeneratedCertificate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["backend.local".to_string()]).unwrap()
    }

    #[test]
    fn certificate_data_decodes_pem_and_der() {
        let certified = self_signed();
        let cert = Certificate::from_der(certified.cert.der()).unwrap();

        let pem = CertificateData::encode(&cert, DataFormat::Pem);
        let der = CertificateData::encode(&cert, DataFormat::Der);

        assert_eq!(pem.format, DataFormat::Pem);
        assert_eq!(der.format, DataFormat::Der);
        assert_eq!(pem.decode().unwrap(), cert);
        assert_eq!(der.decode().unwrap(), cert);
    }

    #[test]
    fn certificate_data_rejects_bad_base64() {
        let data = CertificateData::der_base64("@@@");
        assert!(matches!(data.decode().unwrap_err(), Error::Decode(_)));
    }

    #[test]
    fn private_key_data_decodes_pkcs8_pem() {
        let certified = self_signed();
        let data = PrivateKeyData {
            format: DataFormat::Pem,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: certified.key_pair.serialize_pem(),
        };

        let key = data.decode(KeyAlgorithm::Ec).unwrap();

        assert_eq!(key.der(), certified.key_pair.serialize_der().as_slice());
    }

    #[test]
    fn private_key_data_decodes_rsa_pkcs8_pem() {
        let data = PrivateKeyData {
            format: DataFormat::Pem,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: include_str!("../tests/fixtures/rsa-2048.key.pem").to_string(),
        };

        let key = data.decode(KeyAlgorithm::Rsa).unwrap();

        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);
        assert!(matches!(data.decode(KeyAlgorithm::Ec), Err(Error::Decode(_))));
    }

    #[test]
    fn private_key_data_decodes_base64_der() {
        let certified = self_signed();
        let data = PrivateKeyData {
            format: DataFormat::Der,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: base64::engine::general_purpose::STANDARD
                .encode(certified.key_pair.serialize_der()),
        };

        assert_eq!(data.decode(KeyAlgorithm::Ec).unwrap().algorithm(), KeyAlgorithm::Ec);
    }

    #[test]
    fn private_key_data_rejects_non_pkcs8() {
        let data = PrivateKeyData {
            format: DataFormat::Pem,
            encoding: PrivateKeyEncoding::Der,
            data: self_signed().key_pair.serialize_pem(),
        };

        assert!(matches!(data.decode(KeyAlgorithm::Ec).unwrap_err(), Error::Decode(_)));
    }

    #[test]
    fn private_key_data_rejects_certificate_pem() {
        let data = PrivateKeyData {
            format: DataFormat::Pem,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: self_signed().cert.pem(),
        };

        assert!(matches!(data.decode(KeyAlgorithm::Ec).unwrap_err(), Error::Decode(_)));
    }

    #[test]
    fn private_key_data_debug_redacted() {
        let data = PrivateKeyData {
            format: DataFormat::Pem,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: "secret".into(),
        };
        let debug = format!("{data:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn generate_options_defaults() {
        let options = GenerateCertificateOptions::new("client.svc")
            .subject_alternative_names(vec!["alt.svc".into()])
            .time_to_live(Some(Duration::from_secs(60)));

        assert_eq!(options.format, DataFormat::Pem);
        assert_eq!(options.private_key_encoding, PrivateKeyEncoding::Pkcs8);
        assert_eq!(options.common_name, "client.svc");
        assert_eq!(options.subject_alternative_names, vec!["alt.svc".to_string()]);
        assert_eq!(options.time_to_live, Some(Duration::from_secs(60)));
    }
}
