//! Background renewal scheduling.
//!
//! Every profile gets its own Tokio task that sleeps until the profile's
//! next renewal instant, runs one issuance cycle, and computes the following
//! instant from the outcome. The Tokio timer is the shared timeline; a slow
//! backend call only ever occupies the task of the profile that made it, so
//! other profiles keep renewing on time. A cycle that outlives the policy's
//! issuance timeout is abandoned and counts as a failed issuance.
//!
//! Cycles for one profile never overlap: the next sleep only starts once the
//! previous cycle has published or failed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

const DEFAULT_ISSUANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing policy for credential renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalPolicy {
    /// Delay applied after a failed cycle or when the half-life is not positive.
    min_backoff: Duration,
    /// Optional upper bound on any computed delay.
    max_delay: Option<Duration>,
    /// Longest a single issuance cycle may run before it counts as failed.
    issuance_timeout: Duration,
}

impl RenewalPolicy {
    /// Creates a policy with the given minimum backoff and no delay cap.
    #[must_use]
    pub const fn new(min_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_delay: None,
            issuance_timeout: DEFAULT_ISSUANCE_TIMEOUT,
        }
    }

    /// Caps every computed delay at `max_delay`.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Bounds every issuance cycle by `timeout`.
    #[must_use]
    pub const fn with_issuance_timeout(mut self, timeout: Duration) -> Self {
        self.issuance_timeout = timeout;
        self
    }

    /// Returns the minimum backoff.
    #[must_use]
    pub const fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Returns the delay cap, if any.
    #[must_use]
    pub const fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Returns the issuance timeout.
    #[must_use]
    pub const fn issuance_timeout(&self) -> Duration {
        self.issuance_timeout
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the backoff or the issuance
    /// timeout is zero, or the cap is below the backoff.
    pub fn validate(&self) -> Result<()> {
        if self.min_backoff.is_zero() {
            return Err(Error::Configuration(
                "renewal min_backoff must be greater than 0".into(),
            ));
        }
        if self.issuance_timeout.is_zero() {
            return Err(Error::Configuration(
                "renewal issuance_timeout must be greater than 0".into(),
            ));
        }
        if let Some(max) = self.max_delay {
            if max < self.min_backoff {
                return Err(Error::Configuration(
                    "renewal max_delay must not be below min_backoff".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Runs one issuance cycle, failing it with [`Error::Issuance`] once it
/// exceeds the policy's issuance timeout.
pub(crate) async fn bounded_cycle<T>(
    policy: &RenewalPolicy,
    cycle: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(policy.issuance_timeout, cycle)
        .await
        .unwrap_or_else(|_| {
            Err(Error::Issuance(format!(
                "issuance timed out after {:?}",
                policy.issuance_timeout
            )))
        })
}

/// Computes how long to wait before renewing a bundle expiring at `expires_at`.
///
/// The delay is half of the remaining validity. A non-positive half-life
/// (expired bundle or clock skew) yields the policy's minimum backoff.
#[must_use]
pub fn renewal_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &RenewalPolicy,
) -> Duration {
    let half_life = (expires_at - now) / 2;
    let delay = match half_life.to_std() {
        Ok(delay) if !delay.is_zero() => delay,
        _ => policy.min_backoff,
    };
    policy.max_delay.map_or(delay, |cap| delay.min(cap))
}

/// Lifecycle state of a profile's renewal loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalState {
    /// No renewal loop exists yet.
    #[default]
    Uninitialized,
    /// Waiting for the next renewal instant.
    Scheduled,
    /// An issuance cycle is running.
    Renewing,
    /// The scheduler was shut down.
    Stopped,
}

/// Observable status of one profile's renewal loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalStatus {
    /// Current state.
    pub state: RenewalState,
    /// Approximate wall-clock time of the next cycle.
    pub next_renewal_at: Option<DateTime<Utc>>,
    /// Time of the last successful cycle.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Cause of the last failed cycle, cleared on success.
    pub last_error: Option<String>,
    /// Failed cycles since the last success.
    pub consecutive_failures: u32,
    /// Successful cycles, the initial issuance included.
    pub successes: u64,
}

impl RenewalStatus {
    fn record(&mut self, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => {
                self.last_success_at = Some(Utc::now());
                self.last_error = None;
                self.consecutive_failures = 0;
                self.successes += 1;
            }
            Err(cause) => {
                self.last_error = Some(cause);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }

    fn mark_scheduled(&mut self, delay: Duration) {
        self.state = RenewalState::Scheduled;
        self.next_renewal_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
    }

    fn mark_stopped(&mut self) {
        self.state = RenewalState::Stopped;
        self.next_renewal_at = None;
    }
}

type StatusBoard = Arc<RwLock<HashMap<String, RenewalStatus>>>;

/// Runs one renewal loop per profile until shutdown.
pub struct RenewalScheduler {
    policy: RenewalPolicy,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    statuses: StatusBoard,
}

impl RenewalScheduler {
    /// Creates a scheduler with the given policy.
    #[must_use]
    pub fn new(policy: RenewalPolicy) -> Self {
        Self {
            policy,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the renewal policy.
    #[must_use]
    pub const fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// Starts the renewal loop of `profile`.
    ///
    /// `last_outcome` is the result of the cycle that just ran for this
    /// profile: its expiry on success, its error on failure. The first delay
    /// is the half-life of that expiry, or the minimum backoff after a
    /// failure. `cycle` performs one issue-and-publish round and returns the
    /// new expiry.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyScheduled`] if the profile already has a loop,
    /// [`Error::ShutDown`] after shutdown, and [`Error::Runtime`] outside a
    /// Tokio runtime.
    pub fn schedule<F, Fut>(
        &self,
        profile: impl Into<String>,
        last_outcome: &Result<DateTime<Utc>>,
        cycle: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DateTime<Utc>>> + Send + 'static,
    {
        let profile = profile.into();

        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("renewal requires a Tokio runtime: {e}")))?;

        let delay = match last_outcome {
            Ok(expires_at) => renewal_delay(*expires_at, Utc::now(), &self.policy),
            Err(_) => self.policy.min_backoff,
        };

        {
            let mut statuses = self.statuses.write();
            if statuses.contains_key(&profile) {
                return Err(Error::AlreadyScheduled(profile));
            }
            let mut status = RenewalStatus::default();
            status.record(last_outcome.as_ref().map(|_| ()).map_err(ToString::to_string));
            status.mark_scheduled(delay);
            statuses.insert(profile.clone(), status);
        }

        info!(profile = %profile, next_renewal_in = ?delay, "Scheduled mTLS credential renewal");

        let task = RenewalTask {
            profile,
            policy: self.policy,
            shutdown: self.shutdown.clone(),
            statuses: Arc::clone(&self.statuses),
        };
        self.tasks.lock().spawn_on(task.run(delay, cycle), &handle);

        Ok(())
    }

    /// Returns the status of a profile's renewal loop.
    #[must_use]
    pub fn status(&self, profile: &str) -> Option<RenewalStatus> {
        self.statuses.read().get(profile).cloned()
    }

    /// Returns the profiles that have a renewal loop.
    #[must_use]
    pub fn scheduled_profiles(&self) -> Vec<String> {
        let mut names: Vec<String> = self.statuses.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every pending and in-flight renewal and waits for the loops
    /// to exit. No renewal fires after this returns.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "Renewal task panicked");
                }
            }
        }

        for status in self.statuses.write().values_mut() {
            status.mark_stopped();
        }

        info!("Renewal scheduler stopped");
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("policy", &self.policy)
            .field("profiles", &self.statuses.read().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// The renewal loop of a single profile.
struct RenewalTask {
    profile: String,
    policy: RenewalPolicy,
    shutdown: CancellationToken,
    statuses: StatusBoard,
}

impl RenewalTask {
    async fn run<F, Fut>(self, mut delay: Duration, cycle: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DateTime<Utc>>> + Send + 'static,
    {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            self.update(|status| status.state = RenewalState::Renewing);
            debug!(profile = %self.profile, "Renewing mTLS credentials");

            let outcome = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                outcome = bounded_cycle(&self.policy, cycle()) => outcome,
            };

            delay = self.record(outcome);
        }

        self.update(RenewalStatus::mark_stopped);
        debug!(profile = %self.profile, "Renewal loop exited");
    }

    fn record(&self, outcome: Result<DateTime<Utc>>) -> Duration {
        match outcome {
            Ok(expires_at) => {
                let delay = renewal_delay(expires_at, Utc::now(), &self.policy);
                self.update(|status| {
                    status.record(Ok(()));
                    status.mark_scheduled(delay);
                });
                info!(
                    profile = %self.profile,
                    expires_at = %expires_at,
                    "Refreshing mTLS credentials for profile '{}' in {:?}",
                    self.profile,
                    delay
                );
                delay
            }
            Err(e) => {
                let delay = self.policy.min_backoff;
                let mut failures = 0;
                self.update(|status| {
                    status.record(Err(e.to_string()));
                    status.mark_scheduled(delay);
                    failures = status.consecutive_failures;
                });
                error!(
                    profile = %self.profile,
                    error = %e,
                    consecutive_failures = failures,
                    retry_in = ?delay,
                    "Unable to renew mTLS credentials"
                );
                delay
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut RenewalStatus)) {
        if let Some(status) = self.statuses.write().get_mut(&self.profile) {
            f(status);
        }
    }
}
