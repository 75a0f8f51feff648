//! In-process certificate authority.
//!
//! [`LocalCertificateAuthority`] behaves like a PKI secrets engine mounted at
//! a single path: it holds a root (and optionally an intermediate) CA, a set
//! of issuance roles, and answers [`IssuanceBackend`] calls with freshly
//! signed leaf certificates. It backs development clusters and tests.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{debug, info};

use crate::backend::{
    BackendFuture, CertificateData, DataFormat, GenerateCertificateOptions, GeneratedCertificate,
    IssuanceBackend, PrivateKeyData, PrivateKeyEncoding,
};
use crate::error::{Error, Result};
use crate::types::{Certificate, KeyAlgorithm, SubjectAltName};

/// Validity of generated CA certificates, in days.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Rules a leaf request must satisfy, named like a PKI engine role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRole {
    name: String,
    default_ttl: Duration,
    max_ttl: Duration,
    key_algorithm: KeyAlgorithm,
    allowed_domains: Vec<String>,
    server_auth: bool,
}

impl IssuanceRole {
    /// Creates a role issuing EC client certificates for any name, valid
    /// for one hour by default and at most one day.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86_400),
            key_algorithm: KeyAlgorithm::Ec,
            allowed_domains: Vec::new(),
            server_auth: false,
        }
    }

    /// Sets the lifetime used when a request does not ask for one.
    #[must_use]
    pub const fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the upper bound on any issued lifetime.
    #[must_use]
    pub const fn max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the algorithm of generated keys.
    #[must_use]
    pub const fn key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Restricts issuance to `domain` and its subdomains.
    #[must_use]
    pub fn allowed_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains.push(domain.into());
        self
    }

    /// Also marks issued certificates for server authentication.
    #[must_use]
    pub const fn server_auth(mut self) -> Self {
        self.server_auth = true;
        self
    }

    /// Returns the role name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("role name cannot be empty".into()));
        }
        if self.default_ttl.is_zero() || self.max_ttl.is_zero() {
            return Err(Error::Configuration(format!(
                "role '{}' must have non-zero TTLs",
                self.name
            )));
        }
        if self.key_algorithm == KeyAlgorithm::Rsa {
            return Err(Error::Configuration(format!(
                "role '{}': RSA key generation is not supported",
                self.name
            )));
        }
        Ok(())
    }

    fn ttl_for(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_ttl).min(self.max_ttl)
    }

    fn permits(&self, name: &str) -> bool {
        self.allowed_domains.is_empty()
            || self.allowed_domains.iter().any(|domain| {
                name == domain
                    || name
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
    }

    fn generate_key(&self) -> Result<KeyPair> {
        match self.key_algorithm {
            KeyAlgorithm::Ec => KeyPair::generate(),
            KeyAlgorithm::Ed25519 => KeyPair::generate_for(&rcgen::PKCS_ED25519),
            KeyAlgorithm::Rsa => {
                return Err(Error::Issuance(
                    "RSA key generation is not supported".into(),
                ));
            }
        }
        .map_err(|e| Error::Issuance(format!("failed to generate key pair: {e}")))
    }
}

/// One CA certificate together with its signing key.
struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
    parsed: Certificate,
}

impl Authority {
    fn root(name: &str) -> Result<Self> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Issuance(format!("failed to generate key pair: {e}")))?;
        let params = ca_params(name, BasicConstraints::Unconstrained)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Issuance(format!("failed to generate root certificate: {e}")))?;
        Self::finish(cert, key)
    }

    fn intermediate(name: &str, parent: &Self) -> Result<Self> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Issuance(format!("failed to generate key pair: {e}")))?;
        let params = ca_params(name, BasicConstraints::Constrained(0))?;
        let cert = params.signed_by(&key, &parent.cert, &parent.key).map_err(|e| {
            Error::Issuance(format!("failed to sign intermediate certificate: {e}"))
        })?;
        Self::finish(cert, key)
    }

    fn finish(cert: rcgen::Certificate, key: KeyPair) -> Result<Self> {
        let parsed = Certificate::from_der(cert.der())?;
        Ok(Self { cert, key, parsed })
    }
}

fn ca_params(name: &str, constraints: BasicConstraints) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(constraints);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = Utc::now();
    params.not_before = to_rcgen_time(now - TimeDelta::hours(1))?;
    params.not_after = to_rcgen_time(now + TimeDelta::days(CA_VALIDITY_DAYS))?;
    Ok(params)
}

/// A PKI engine served from memory.
pub struct LocalCertificateAuthority {
    mount: String,
    root: Authority,
    intermediate: Option<Authority>,
    roles: HashMap<String, IssuanceRole>,
    include_ca_chain: bool,
}

impl LocalCertificateAuthority {
    /// Creates an engine at `mount` with a fresh self-signed root named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount is blank or key generation fails.
    pub fn new(mount: impl Into<String>, name: &str) -> Result<Self> {
        let mount = mount.into();
        if mount.trim().is_empty() {
            return Err(Error::Configuration("mount cannot be empty".into()));
        }

        info!(mount = %mount, "Creating local certificate authority: {}", name);

        Ok(Self {
            mount,
            root: Authority::root(name)?,
            intermediate: None,
            roles: HashMap::new(),
            include_ca_chain: false,
        })
    }

    /// Issues leaves from an intermediate CA named `name`, signed by the root.
    ///
    /// # Errors
    ///
    /// Returns an error if generating the intermediate fails.
    pub fn with_intermediate(mut self, name: &str) -> Result<Self> {
        self.intermediate = Some(Authority::intermediate(name, &self.root)?);
        debug!(mount = %self.mount, "Intermediate CA created: {}", name);
        Ok(self)
    }

    /// Registers a role, replacing any role of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the role is invalid.
    pub fn with_role(mut self, role: IssuanceRole) -> Result<Self> {
        role.validate()?;
        self.roles.insert(role.name.clone(), role);
        Ok(self)
    }

    /// Controls whether generated certificates carry the CA chain.
    #[must_use]
    pub const fn include_ca_chain(mut self, include: bool) -> Self {
        self.include_ca_chain = include;
        self
    }

    /// Returns the mount path this engine answers on.
    #[must_use]
    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Returns the root CA certificate.
    #[must_use]
    pub const fn root_certificate(&self) -> &Certificate {
        &self.root.parsed
    }

    /// Returns the CA that signs leaf certificates.
    #[must_use]
    pub fn issuing_certificate(&self) -> &Certificate {
        &self.issuer().parsed
    }

    fn issuer(&self) -> &Authority {
        self.intermediate.as_ref().unwrap_or(&self.root)
    }

    /// Certificates above the issuing CA, nearest first.
    fn parents(&self) -> Vec<&Certificate> {
        if self.intermediate.is_some() {
            vec![&self.root.parsed]
        } else {
            Vec::new()
        }
    }

    fn check_mount(&self, mount: &str) -> Result<()> {
        if mount == self.mount {
            Ok(())
        } else {
            Err(Error::Issuance(format!("no PKI engine mounted at '{mount}'")))
        }
    }

    /// Generates a leaf certificate for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issuance`] for unknown roles, names outside the
    /// role's domains, unsupported key encodings, or signing failures.
    pub fn issue(
        &self,
        role: &str,
        options: &GenerateCertificateOptions,
    ) -> Result<GeneratedCertificate> {
        let role = self
            .roles
            .get(role)
            .ok_or_else(|| Error::Issuance(format!("unknown role '{role}'")))?;

        if options.common_name.trim().is_empty() {
            return Err(Error::Issuance("common_name is required".into()));
        }
        if options.private_key_encoding != PrivateKeyEncoding::Pkcs8 {
            return Err(Error::Issuance(
                "only pkcs8 private keys can be generated".into(),
            ));
        }

        let sans: Vec<SubjectAltName> = options
            .subject_alternative_names
            .iter()
            .map(|name| SubjectAltName::parse(name))
            .collect();

        for name in std::iter::once(options.common_name.as_str()).chain(sans.iter().filter_map(
            |san| match san {
                SubjectAltName::Dns(dns) => Some(dns.as_str()),
                _ => None,
            },
        )) {
            if !role.permits(name) {
                return Err(Error::Issuance(format!(
                    "name '{name}' not allowed by role '{}'",
                    role.name
                )));
            }
        }

        info!(
            mount = %self.mount,
            role = %role.name,
            "Issuing certificate for: {}",
            options.common_name
        );

        let key = role.generate_key()?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, options.common_name.as_str());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        if role.server_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        params.subject_alt_names = convert_sans(&sans)?;

        let ttl = TimeDelta::from_std(role.ttl_for(options.time_to_live))
            .map_err(|e| Error::Issuance(format!("invalid ttl: {e}")))?;
        let now = Utc::now();
        params.not_before = to_rcgen_time(now - TimeDelta::hours(1))?;
        params.not_after = to_rcgen_time(now + ttl)?;

        let issuer = self.issuer();
        let cert = params
            .signed_by(&key, &issuer.cert, &issuer.key)
            .map_err(|e| Error::Issuance(format!("failed to sign certificate: {e}")))?;
        let leaf = Certificate::from_der(cert.der())?;

        let ca_chain = self.include_ca_chain.then(|| {
            std::iter::once(&issuer.parsed)
                .chain(self.parents())
                .map(|ca| CertificateData::encode(ca, options.format))
                .collect()
        });

        let private_key = PrivateKeyData {
            format: options.format,
            encoding: PrivateKeyEncoding::Pkcs8,
            data: match options.format {
                DataFormat::Pem => key.serialize_pem(),
                DataFormat::Der => {
                    base64::engine::general_purpose::STANDARD.encode(key.serialize_der())
                }
            },
        };

        debug!(
            serial = %leaf.serial_number(),
            not_after = %leaf.not_after(),
            "Certificate issued successfully for: {}",
            options.common_name
        );

        Ok(GeneratedCertificate {
            certificate: CertificateData::encode(&leaf, options.format),
            issuing_ca: CertificateData::encode(&issuer.parsed, options.format),
            ca_chain,
            private_key,
            private_key_type: role.key_algorithm,
            serial_number: leaf.serial_number().to_string(),
        })
    }
}

impl IssuanceBackend for LocalCertificateAuthority {
    fn certificate_authority<'a>(&'a self, mount: &'a str) -> BackendFuture<'a, CertificateData> {
        Box::pin(async move {
            self.check_mount(mount)?;
            Ok(CertificateData::pem(self.issuing_certificate().pem()))
        })
    }

    fn certificate_authority_chain<'a>(
        &'a self,
        mount: &'a str,
    ) -> BackendFuture<'a, Vec<CertificateData>> {
        Box::pin(async move {
            self.check_mount(mount)?;
            Ok(self
                .parents()
                .into_iter()
                .map(|ca| CertificateData::pem(ca.pem()))
                .collect())
        })
    }

    fn generate_certificate<'a>(
        &'a self,
        mount: &'a str,
        role: &'a str,
        options: &'a GenerateCertificateOptions,
    ) -> BackendFuture<'a, GeneratedCertificate> {
        Box::pin(async move {
            self.check_mount(mount)?;
            self.issue(role, options)
        })
    }
}

impl std::fmt::Debug for LocalCertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCertificateAuthority")
            .field("mount", &self.mount)
            .field("root", &self.root.parsed.subject())
            .field(
                "intermediate",
                &self.intermediate.as_ref().map(|ca| ca.parsed.subject()),
            )
            .field("roles", &self.roles.keys().collect::<Vec<_>>())
            .field("keys", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Converts `SubjectAltNames` to rcgen `SanTypes`.
fn convert_sans(sans: &[SubjectAltName]) -> Result<Vec<SanType>> {
    let ia5 = |kind: &str, value: &str| {
        Ia5String::try_from(value.to_string())
            .map_err(|e| Error::Issuance(format!("invalid {kind} '{value}': {e}")))
    };

    sans.iter()
        .map(|san| match san {
            SubjectAltName::Dns(dns) => ia5("DNS name", dns).map(SanType::DnsName),
            SubjectAltName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            SubjectAltName::Email(email) => ia5("email", email).map(SanType::Rfc822Name),
            SubjectAltName::Uri(uri) => ia5("URI", uri).map(SanType::URI),
        })
        .collect()
}

/// Converts a chrono `DateTime` to rcgen `OffsetDateTime`.
fn to_rcgen_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Issuance(format!("invalid timestamp: {e}")))
}
