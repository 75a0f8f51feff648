//! Credential lifecycle manager.
//!
//! The manager is the single entry point of the crate: it performs the first
//! issuance for every registered profile, hands each profile to the renewal
//! scheduler, and serves consumer lookups from the cache.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backend::{CertificateData, GenerateCertificateOptions, IssuanceBackend};
use crate::cache::CredentialCache;
use crate::error::{Error, Result};
use crate::profile::{MtlsConfig, ProfileDefinition, ProfileRegistry};
use crate::scheduler::{RenewalPolicy, RenewalScheduler, RenewalStatus, bounded_cycle};
use crate::types::{Certificate, CredentialBundle};

/// One renewal round of a profile, resolving to the new expiry.
type CycleFuture = Pin<Box<dyn Future<Output = Result<DateTime<Utc>>> + Send>>;

/// Outcome of [`CredentialLifecycleManager::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitializationReport {
    /// Profiles holding a bundle after the first cycle.
    pub ready: Vec<String>,
    /// Profiles whose first cycle failed; they are retried in the background.
    pub pending: Vec<String>,
}

impl InitializationReport {
    /// Returns true if every profile was issued.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Keeps a fresh credential bundle available for every registered profile.
pub struct CredentialLifecycleManager {
    registry: Arc<ProfileRegistry>,
    backend: Arc<dyn IssuanceBackend>,
    cache: Arc<CredentialCache>,
    scheduler: RenewalScheduler,
    initialized: AtomicBool,
}

impl CredentialLifecycleManager {
    /// Creates a manager for the given profiles and backend.
    ///
    /// No issuance happens until [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the registry is empty or the
    /// policy is invalid.
    pub fn new(
        registry: ProfileRegistry,
        backend: Arc<dyn IssuanceBackend>,
        policy: RenewalPolicy,
    ) -> Result<Self> {
        if registry.is_empty() {
            return Err(Error::Configuration(
                "at least one mTLS profile must be configured".into(),
            ));
        }
        policy.validate()?;

        let cache = CredentialCache::new(registry.names());

        Ok(Self {
            registry: Arc::new(registry),
            backend,
            cache: Arc::new(cache),
            scheduler: RenewalScheduler::new(policy),
            initialized: AtomicBool::new(false),
        })
    }

    /// Creates a manager from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn from_config(config: &MtlsConfig, backend: Arc<dyn IssuanceBackend>) -> Result<Self> {
        Self::new(ProfileRegistry::from_config(config)?, backend, config.renewal)
    }

    /// Returns the registered profiles.
    #[must_use]
    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Returns the renewal policy.
    #[must_use]
    pub const fn policy(&self) -> &RenewalPolicy {
        self.scheduler.policy()
    }

    /// Issues the first bundle of every profile and starts renewal.
    ///
    /// First cycles for all profiles run concurrently, each bounded by the
    /// policy's issuance timeout, and complete before this returns. A failed
    /// profile is logged, keeps an empty slot, and is still scheduled so it
    /// is retried after the minimum backoff. A profile that cannot be
    /// scheduled is logged and skipped. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyScheduled`] on a second call,
    /// [`Error::ShutDown`] after shutdown, and [`Error::Runtime`] outside a
    /// Tokio runtime.
    pub async fn initialize(&self) -> Result<InitializationReport> {
        if self.scheduler.is_shut_down() {
            return Err(Error::ShutDown);
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("renewal requires a Tokio runtime: {e}")))?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            let first = self.registry.names().next().unwrap_or_default();
            return Err(Error::AlreadyScheduled(first.to_string()));
        }

        info!(profiles = self.registry.len(), "Initializing mTLS credentials");

        let mut first_cycles = JoinSet::new();
        for (index, definition) in self.registry.definitions().iter().enumerate() {
            let backend = Arc::clone(&self.backend);
            let definition = definition.clone();
            let policy = *self.policy();
            first_cycles.spawn(async move {
                let outcome =
                    bounded_cycle(&policy, issue_bundle(backend.as_ref(), &definition)).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<CredentialBundle>>> =
            std::iter::repeat_with(|| None).take(self.registry.len()).collect();
        while let Some(joined) = first_cycles.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => warn!(error = %e, "First mTLS issuance task failed"),
            }
        }

        let mut report = InitializationReport::default();

        for (definition, outcome) in self.registry.definitions().iter().zip(outcomes) {
            let outcome = outcome
                .unwrap_or_else(|| Err(Error::Runtime("first issuance task did not complete".into())))
                .and_then(|bundle| {
                    let expires_at = bundle.expires_at();
                    self.cache.publish(definition.name(), bundle).map(|_| expires_at)
                });

            match &outcome {
                Ok(_) => report.ready.push(definition.name().to_string()),
                Err(e) => {
                    error!(
                        profile = %definition.name(),
                        error = %e,
                        retry_in = ?self.policy().min_backoff(),
                        "Unable to issue mTLS credentials"
                    );
                    report.pending.push(definition.name().to_string());
                }
            }

            let cycle = renewal_cycle(
                Arc::clone(&self.backend),
                Arc::clone(&self.cache),
                definition.clone(),
            );
            if let Err(e) = self.scheduler.schedule(definition.name(), &outcome, cycle) {
                error!(
                    profile = %definition.name(),
                    error = %e,
                    "Unable to schedule mTLS renewal"
                );
            }
        }

        info!(
            ready = report.ready.len(),
            pending = report.pending.len(),
            "mTLS credentials initialized"
        );

        Ok(report)
    }

    /// Runs one issuance cycle for `definition` without publishing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issuance`] for backend failures or when the cycle
    /// exceeds the issuance timeout, and [`Error::Decode`] for unusable
    /// material.
    pub async fn issuance_cycle(&self, definition: &ProfileDefinition) -> Result<CredentialBundle> {
        bounded_cycle(self.policy(), issue_bundle(self.backend.as_ref(), definition)).await
    }

    /// Returns the current bundle of a profile.
    ///
    /// Only reads the cache; it never triggers issuance. `Ok(None)` means the
    /// profile has not been issued successfully yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the profile is not registered.
    pub fn get_config(&self, profile: &str) -> Result<Option<Arc<CredentialBundle>>> {
        if !self.cache.contains(profile) {
            return Err(Error::NotFound(profile.to_string()));
        }
        Ok(self.cache.get(profile))
    }

    /// Returns the renewal status of a profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the profile is not registered.
    pub fn status(&self, profile: &str) -> Result<RenewalStatus> {
        if !self.registry.contains(profile) {
            return Err(Error::NotFound(profile.to_string()));
        }
        Ok(self.scheduler.status(profile).unwrap_or_default())
    }

    /// Stops all renewals and waits for in-flight cycles to be abandoned.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

impl std::fmt::Debug for CredentialLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLifecycleManager")
            .field("profiles", &self.registry.names().collect::<Vec<_>>())
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Builds the issue-and-publish round the scheduler runs for a profile.
fn renewal_cycle(
    backend: Arc<dyn IssuanceBackend>,
    cache: Arc<CredentialCache>,
    definition: ProfileDefinition,
) -> impl Fn() -> CycleFuture + Send + Sync + 'static {
    let definition = Arc::new(definition);

    move || -> CycleFuture {
        let backend = Arc::clone(&backend);
        let cache = Arc::clone(&cache);
        let definition = Arc::clone(&definition);
        Box::pin(async move {
            let bundle = issue_bundle(backend.as_ref(), &definition).await?;
            let expires_at = bundle.expires_at();
            cache.publish(definition.name(), bundle)?;
            Ok(expires_at)
        })
    }
}

/// Fetches the CA material and a new leaf for `definition`, then assembles
/// the bundle.
async fn issue_bundle(
    backend: &dyn IssuanceBackend,
    definition: &ProfileDefinition,
) -> Result<CredentialBundle> {
    let mount = definition.mount();

    let ca = backend.certificate_authority(mount).await?.decode()?;
    let ca_parents = backend.certificate_authority_chain(mount).await?;
    let ca_parents = decode_all(&ca_parents)?;

    let options = GenerateCertificateOptions::new(definition.common_name())
        .subject_alternative_names(definition.subject_alternate_names().to_vec())
        .time_to_live(definition.ttl());
    let generated = backend
        .generate_certificate(mount, definition.role(), &options)
        .await?;

    let mut client_chain = vec![generated.certificate.decode()?];
    match &generated.ca_chain {
        Some(chain) if !chain.is_empty() => client_chain.extend(decode_all(chain)?),
        _ => client_chain.push(generated.issuing_ca.decode()?),
    }

    let private_key = generated.private_key.decode(generated.private_key_type)?;
    let trusted_ca_chain = dedup(std::iter::once(ca).chain(ca_parents));

    let bundle = CredentialBundle::new(client_chain, private_key, trusted_ca_chain)?;

    if bundle.is_expired() {
        warn!(
            profile = %definition.name(),
            expires_at = %bundle.expires_at(),
            "Backend issued an already expired certificate"
        );
    }

    info!(
        profile = %definition.name(),
        serial = %generated.serial_number,
        expires_at = %bundle.expires_at(),
        "Issued mTLS credentials"
    );

    Ok(bundle)
}

fn decode_all(data: &[CertificateData]) -> Result<Vec<Certificate>> {
    data.iter().map(CertificateData::decode).collect()
}

/// Drops repeated certificates, keeping the first occurrence.
fn dedup(certs: impl IntoIterator<Item = Certificate>) -> Vec<Certificate> {
    let mut unique: Vec<Certificate> = Vec::new();
    for cert in certs {
        if !unique.iter().any(|seen| seen.der() == cert.der()) {
            unique.push(cert);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFuture, GeneratedCertificate};
    use crate::ca::{IssuanceRole, LocalCertificateAuthority};
    use crate::scheduler::RenewalState;
    use crate::types::KeyAlgorithm;
    use std::time::Duration;

    fn authority(intermediate: bool, include_chain: bool) -> LocalCertificateAuthority {
        let ca = LocalCertificateAuthority::new("pki", "Test Root CA")
            .unwrap()
            .with_role(IssuanceRole::new("client").max_ttl(Duration::from_secs(7200)))
            .unwrap()
            .include_ca_chain(include_chain);
        if intermediate {
            ca.with_intermediate("Test Issuing CA").unwrap()
        } else {
            ca
        }
    }

    fn profile(name: &str) -> ProfileDefinition {
        ProfileDefinition::builder(name, "client", format!("{name}.svc.local"))
            .build()
            .unwrap()
    }

    fn manager(backend: impl IssuanceBackend + 'static) -> CredentialLifecycleManager {
        let registry = ProfileRegistry::new(vec![profile("payments")]).unwrap();
        CredentialLifecycleManager::new(registry, Arc::new(backend), RenewalPolicy::default())
            .unwrap()
    }

    fn subjects(certs: &[Certificate]) -> Vec<&str> {
        certs.iter().map(Certificate::subject).collect()
    }

    /// Reports a different key type than the one it generated.
    struct MislabeledKeys(LocalCertificateAuthority);

    impl IssuanceBackend for MislabeledKeys {
        fn certificate_authority<'a>(
            &'a self,
            mount: &'a str,
        ) -> BackendFuture<'a, CertificateData> {
            self.0.certificate_authority(mount)
        }

        fn certificate_authority_chain<'a>(
            &'a self,
            mount: &'a str,
        ) -> BackendFuture<'a, Vec<CertificateData>> {
            self.0.certificate_authority_chain(mount)
        }

        fn generate_certificate<'a>(
            &'a self,
            mount: &'a str,
            role: &'a str,
            options: &'a GenerateCertificateOptions,
        ) -> BackendFuture<'a, GeneratedCertificate> {
            Box::pin(async move {
                let mut generated = self.0.generate_certificate(mount, role, options).await?;
                generated.private_key_type = KeyAlgorithm::Ed25519;
                Ok(generated)
            })
        }
    }

    #[test]
    fn empty_registry_is_rejected() {
        let registry = ProfileRegistry::new(Vec::new()).unwrap();
        let result = CredentialLifecycleManager::new(
            registry,
            Arc::new(authority(false, false)),
            RenewalPolicy::default(),
        );
        assert!(matches!(result.unwrap_err(), Error::Configuration(_)));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let registry = ProfileRegistry::new(vec![profile("payments")]).unwrap();
        let result = CredentialLifecycleManager::new(
            registry,
            Arc::new(authority(false, false)),
            RenewalPolicy::new(Duration::ZERO),
        );
        assert!(matches!(result.unwrap_err(), Error::Configuration(_)));
    }

    #[tokio::test]
    async fn schedule_failure_does_not_stop_other_profiles() {
        let registry = ProfileRegistry::new(vec![profile("payments"), profile("ledger")]).unwrap();
        let manager = CredentialLifecycleManager::new(
            registry,
            Arc::new(authority(false, false)),
            RenewalPolicy::default(),
        )
        .unwrap();
        manager
            .scheduler
            .schedule("payments", &Err(Error::Issuance("taken".into())), || {
                std::future::pending::<Result<DateTime<Utc>>>()
            })
            .unwrap();

        let report = manager.initialize().await.unwrap();

        assert_eq!(report.ready, ["payments", "ledger"]);
        assert!(manager.get_config("ledger").unwrap().is_some());
        assert_eq!(manager.status("ledger").unwrap().state, RenewalState::Scheduled);

        manager.shutdown().await;
    }

    #[test]
    fn lookups_before_initialize() {
        let manager = manager(authority(false, false));

        assert!(manager.get_config("payments").unwrap().is_none());
        assert!(matches!(
            manager.get_config("ghost").unwrap_err(),
            Error::NotFound(name) if name == "ghost"
        ));
        assert_eq!(
            manager.status("payments").unwrap().state,
            RenewalState::Uninitialized
        );
        assert!(matches!(manager.status("ghost").unwrap_err(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn chain_falls_back_to_issuing_ca() {
        let manager = manager(authority(false, false));
        let bundle = manager
            .issuance_cycle(&profile("payments"))
            .await
            .unwrap();

        assert_eq!(
            subjects(bundle.client_chain()),
            ["payments.svc.local", "Test Root CA"]
        );
        assert_eq!(subjects(bundle.trusted_ca_chain()), ["Test Root CA"]);
        assert_eq!(bundle.private_key().algorithm(), KeyAlgorithm::Ec);
    }

    #[tokio::test]
    async fn chain_uses_explicit_ca_chain() {
        let manager = manager(authority(true, true));
        let bundle = manager
            .issuance_cycle(&profile("payments"))
            .await
            .unwrap();

        assert_eq!(
            subjects(bundle.client_chain()),
            ["payments.svc.local", "Test Issuing CA", "Test Root CA"]
        );
        assert_eq!(
            subjects(bundle.trusted_ca_chain()),
            ["Test Issuing CA", "Test Root CA"]
        );
    }

    #[tokio::test]
    async fn expiry_comes_from_leaf_not_requested_ttl() {
        let manager = manager(authority(false, false));
        let definition = ProfileDefinition::builder("payments", "client", "payments.svc.local")
            .ttl(Some(Duration::from_secs(86_400)))
            .build()
            .unwrap();

        let bundle = manager.issuance_cycle(&definition).await.unwrap();

        assert_eq!(bundle.expires_at(), bundle.leaf().not_after());
        // role max_ttl is two hours
        assert!(bundle.remaining_validity() <= Duration::from_secs(7200));
        assert!(bundle.remaining_validity() > Duration::from_secs(7100));
    }

    #[tokio::test]
    async fn mislabeled_key_type_fails_to_decode() {
        let manager = manager(MislabeledKeys(authority(false, false)));
        let err = manager
            .issuance_cycle(&profile("payments"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn wrong_mount_is_an_issuance_error() {
        let manager = manager(authority(false, false));
        let definition = ProfileDefinition::builder("payments", "client", "payments.svc.local")
            .mount("pki-int")
            .build()
            .unwrap();

        let err = manager.issuance_cycle(&definition).await.unwrap_err();
        assert!(matches!(err, Error::Issuance(_)));
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let manager = manager(authority(false, false));

        let report = manager.initialize().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.ready, ["payments"]);

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyScheduled(_)));

        manager.shutdown().await;
        assert_eq!(manager.status("payments").unwrap().state, RenewalState::Stopped);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = rcgen::generate_simple_self_signed(vec!["a.local".into()]).unwrap();
        let b = rcgen::generate_simple_self_signed(vec!["b.local".into()]).unwrap();
        let a = Certificate::from_der(a.cert.der()).unwrap();
        let b = Certificate::from_der(b.cert.der()).unwrap();

        let unique = dedup([a.clone(), b.clone(), a.clone()]);

        assert_eq!(unique, vec![a, b]);
    }
}
