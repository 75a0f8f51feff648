//! mTLS profile definitions and the registry that holds them.
//!
//! A profile names one client identity: which backend mount and role issue
//! its certificates, which common name and alternate names they carry, and
//! how long they should live. Profiles are loaded once at startup and never
//! change afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scheduler::RenewalPolicy;

/// Mount used when a profile does not name one.
pub const DEFAULT_PKI_MOUNT: &str = "pki";

fn default_mount() -> String {
    DEFAULT_PKI_MOUNT.to_string()
}

/// Configuration of a single profile, as found in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// PKI role used to issue certificates.
    pub role: String,
    /// Mount of the PKI engine.
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Common name of issued certificates.
    pub common_name: String,
    /// Subject alternative names of issued certificates.
    #[serde(default)]
    pub subject_alternate_names: Option<Vec<String>>,
    /// Requested certificate lifetime in seconds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Top-level mTLS configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MtlsConfig {
    /// Profiles keyed by name.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
    /// Renewal timing.
    #[serde(default)]
    pub renewal: RenewalPolicy,
}

impl MtlsConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid JSON: {e}")))
    }
}

/// Immutable definition of one mTLS profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDefinition {
    name: String,
    mount: String,
    role: String,
    common_name: String,
    subject_alternate_names: Vec<String>,
    ttl: Option<Duration>,
}

impl ProfileDefinition {
    /// Creates a new profile definition builder.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        role: impl Into<String>,
        common_name: impl Into<String>,
    ) -> ProfileDefinitionBuilder {
        ProfileDefinitionBuilder {
            name: name.into(),
            mount: default_mount(),
            role: role.into(),
            common_name: common_name.into(),
            subject_alternate_names: Vec::new(),
            ttl: None,
        }
    }

    /// Builds a definition from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the entry is incomplete.
    pub fn from_config(name: &str, config: &ProfileConfig) -> Result<Self> {
        let mut builder = Self::builder(name, &config.role, &config.common_name)
            .mount(&config.mount)
            .ttl(config.ttl_secs.map(Duration::from_secs));
        if let Some(names) = &config.subject_alternate_names {
            builder = names.iter().fold(builder, |b, san| b.subject_alternate_name(san));
        }
        builder.build()
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required field is empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("profile name cannot be empty".into()));
        }
        if self.mount.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "profile '{}' has an empty mount",
                self.name
            )));
        }
        if self.role.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "profile '{}' has no role",
                self.name
            )));
        }
        if self.common_name.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "profile '{}' has no common name",
                self.name
            )));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(Error::Configuration(format!(
                "profile '{}' requests a zero ttl",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns the profile name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the PKI mount.
    #[must_use]
    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Returns the issuance role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the requested common name.
    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Returns the requested subject alternate names.
    #[must_use]
    pub fn subject_alternate_names(&self) -> &[String] {
        &self.subject_alternate_names
    }

    /// Returns the requested certificate lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Builder for profile definitions.
#[derive(Debug)]
pub struct ProfileDefinitionBuilder {
    name: String,
    mount: String,
    role: String,
    common_name: String,
    subject_alternate_names: Vec<String>,
    ttl: Option<Duration>,
}

impl ProfileDefinitionBuilder {
    /// Sets the PKI mount.
    #[must_use]
    pub fn mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    /// Adds a subject alternate name.
    #[must_use]
    pub fn subject_alternate_name(mut self, name: impl Into<String>) -> Self {
        self.subject_alternate_names.push(name.into());
        self
    }

    /// Sets the requested certificate lifetime.
    #[must_use]
    pub const fn ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builds the profile definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the definition is invalid.
    pub fn build(self) -> Result<ProfileDefinition> {
        let definition = ProfileDefinition {
            name: self.name,
            mount: self.mount,
            role: self.role,
            common_name: self.common_name,
            subject_alternate_names: self.subject_alternate_names,
            ttl: self.ttl,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// The immutable set of profiles known to the process.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    definitions: Vec<ProfileDefinition>,
}

impl ProfileRegistry {
    /// Creates a registry, validating every definition and name uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid definition or a
    /// duplicated profile name.
    pub fn new(definitions: Vec<ProfileDefinition>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(definitions.len());
        for definition in &definitions {
            definition.validate()?;
            if !seen.insert(definition.name()) {
                return Err(Error::Configuration(format!(
                    "duplicate profile name '{}'",
                    definition.name()
                )));
            }
        }
        Ok(Self { definitions })
    }

    /// Creates a registry from configuration, in profile-name order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid profile entry.
    pub fn from_config(config: &MtlsConfig) -> Result<Self> {
        let definitions = config
            .profiles
            .iter()
            .map(|(name, profile)| ProfileDefinition::from_config(name, profile))
            .collect::<Result<Vec<_>>>()?;
        Self::new(definitions)
    }

    /// Returns all definitions in registration order.
    #[must_use]
    pub fn definitions(&self) -> &[ProfileDefinition] {
        &self.definitions
    }

    /// Looks up a definition by profile name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProfileDefinition> {
        self.definitions.iter().find(|d| d.name() == name)
    }

    /// Returns true if the profile is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the registered profile names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(ProfileDefinition::name)
    }

    /// Returns the number of registered profiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns true if no profile is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
