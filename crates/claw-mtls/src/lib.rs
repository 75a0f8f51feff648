//! Continuously renewed mutual-TLS credentials for Clawbernetes.
#![forbid(unsafe_code)]
//!
//! Services name the client identities they need as profiles. For every
//! profile this crate obtains a certificate, its private key, and the CA
//! chain from an issuance backend, keeps the result in a lock-free cache,
//! and renews it in the background at half of the remaining validity.
//!
//! # Overview
//!
//! The `claw-mtls` crate provides:
//! - Profile definitions loaded from JSON configuration
//! - A backend boundary for PKI secrets engines, plus an in-process CA
//! - Chain assembly and key decoding into immutable credential bundles
//! - Per-profile renewal tasks with failure backoff and clean shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use claw_mtls::{
//!     CredentialLifecycleManager, IssuanceRole, LocalCertificateAuthority, ProfileDefinition,
//!     ProfileRegistry, RenewalPolicy,
//! };
//!
//! # async fn run() -> claw_mtls::Result<()> {
//! let backend = LocalCertificateAuthority::new("pki", "Clawbernetes Root CA")?
//!     .with_role(IssuanceRole::new("payments-client"))?;
//!
//! let registry = ProfileRegistry::new(vec![
//!     ProfileDefinition::builder("payments", "payments-client", "payments.svc.local").build()?,
//! ])?;
//!
//! let manager =
//!     CredentialLifecycleManager::new(registry, Arc::new(backend), RenewalPolicy::default())?;
//! manager.initialize().await?;
//!
//! if let Some(bundle) = manager.get_config("payments")? {
//!     println!("serving with certificate expiring at {}", bundle.expires_at());
//!     let _chain_pem = bundle.client_chain_pem();
//!     let _key_pem = bundle.private_key().pem();
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`manager`] - Lifecycle entry point and consumer lookup
//! - [`scheduler`] - Renewal timing and background tasks
//! - [`cache`] - Latest bundle per profile
//! - [`backend`] - Issuance backend boundary
//! - [`ca`] - In-process certificate authority
//! - [`profile`] - Profile definitions and configuration
//! - [`types`] - Certificates, keys and bundles
//! - [`error`] - Error types

pub mod backend;
pub mod ca;
pub mod cache;
pub mod error;
pub mod manager;
pub mod profile;
pub mod scheduler;
pub mod types;

pub use backend::{
    BackendFuture, CertificateData, DataFormat, GenerateCertificateOptions, GeneratedCertificate,
    IssuanceBackend, PrivateKeyData, PrivateKeyEncoding,
};
pub use ca::{IssuanceRole, LocalCertificateAuthority};
pub use cache::CredentialCache;
pub use error::{Error, Result};
pub use manager::{CredentialLifecycleManager, InitializationReport};
pub use profile::{
    MtlsConfig, ProfileConfig, ProfileDefinition, ProfileDefinitionBuilder, ProfileRegistry,
};
pub use scheduler::{RenewalPolicy, RenewalScheduler, RenewalState, RenewalStatus, renewal_delay};
pub use types::{Certificate, CredentialBundle, KeyAlgorithm, PrivateKey, SubjectAltName};
