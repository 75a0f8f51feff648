//! Lock-free store of the latest credential bundle per profile.
//!
//! The set of profiles is fixed when the cache is created. Each profile owns
//! one slot holding an `Arc<CredentialBundle>`; publishing swaps the whole
//! `Arc`, so readers always observe a complete bundle and keep whatever they
//! loaded valid for as long as they hold it.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::CredentialBundle;

/// The latest issued bundle of every registered profile.
pub struct CredentialCache {
    slots: HashMap<String, ArcSwapOption<CredentialBundle>>,
}

impl CredentialCache {
    /// Creates an empty slot for each profile name.
    #[must_use]
    pub fn new<I, S>(profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slots: profiles
                .into_iter()
                .map(|name| (name.into(), ArcSwapOption::empty()))
                .collect(),
        }
    }

    /// Returns the current bundle of a profile.
    ///
    /// `None` means the profile is unknown or has never been issued; use
    /// [`CredentialCache::contains`] to tell the two apart.
    #[must_use]
    pub fn get(&self, profile: &str) -> Option<Arc<CredentialBundle>> {
        self.slots.get(profile).and_then(|slot| slot.load_full())
    }

    /// Replaces the bundle of a profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the profile has no slot.
    pub fn publish(&self, profile: &str, bundle: CredentialBundle) -> Result<Arc<CredentialBundle>> {
        let slot = self
            .slots
            .get(profile)
            .ok_or_else(|| Error::NotFound(profile.to_string()))?;

        let bundle = Arc::new(bundle);
        slot.store(Some(Arc::clone(&bundle)));

        debug!(
            profile = %profile,
            serial = %bundle.leaf().serial_number(),
            expires_at = %bundle.expires_at(),
            "Published credential bundle"
        );

        Ok(bundle)
    }

    /// Returns true if the profile has a slot.
    #[must_use]
    pub fn contains(&self, profile: &str) -> bool {
        self.slots.contains_key(profile)
    }

    /// Returns the names of profiles that currently hold a bundle.
    #[must_use]
    pub fn published(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.load().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the cache has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("profiles", &self.slots.len())
            .field("published", &self.published())
            .finish()
    }
}
