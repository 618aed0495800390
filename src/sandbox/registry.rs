//! Language profiles and the registry that resolves them.
//!
//! A profile says which isolated runtime (container image) runs a language,
//! which extension the source file gets, and how the interpreter is invoked.
//! The registry is built once at startup and only read afterwards, so it can
//! be shared between requests without locking.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::RegistryError;

/// Placeholder in an entrypoint template replaced by the source file name.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// How to run one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProfile {
    /// Language identifier used by callers (e.g. `python`).
    pub language: String,
    /// Extension of the source file, without the dot.
    pub file_extension: String,
    /// Container image the code runs in.
    pub isolated_runtime_name: String,
    /// Interpreter argv; `{file}` is replaced by the source file name.
    pub entrypoint_template: Vec<String>,
    /// Other identifiers accepted for this language.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ExecutionProfile {
    /// Creates a profile without aliases.
    pub fn new<I, S>(
        language: impl Into<String>,
        file_extension: impl Into<String>,
        isolated_runtime_name: impl Into<String>,
        entrypoint_template: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            language: language.into(),
            file_extension: file_extension.into(),
            isolated_runtime_name: isolated_runtime_name.into(),
            entrypoint_template: entrypoint_template.into_iter().map(Into::into).collect(),
            aliases: Vec::new(),
        }
    }

    /// Adds an alternative identifier.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Builds the argv that runs `file_name` inside the workspace.
    ///
    /// Templates without a `{file}` placeholder get the file name appended.
    #[must_use]
    pub fn command_for(&self, file_name: &str) -> Vec<String> {
        let mut substituted = false;
        let mut argv: Vec<String> = self
            .entrypoint_template
            .iter()
            .map(|part| {
                if part.contains(FILE_PLACEHOLDER) {
                    substituted = true;
                    part.replace(FILE_PLACEHOLDER, file_name)
                } else {
                    part.clone()
                }
            })
            .collect();

        if !substituted {
            argv.push(file_name.to_string());
        }
        argv
    }

    /// Checks the profile is complete and its extension is a plain suffix.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidProfile` naming the offending field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidProfile {
            language: self.language.clone(),
            reason: reason.to_string(),
        };

        if self.language.trim().is_empty() {
            return Err(invalid("language is empty"));
        }
        if self.file_extension.is_empty()
            || !self
                .file_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("fileExtension must be a non-empty alphanumeric suffix"));
        }
        if self.isolated_runtime_name.trim().is_empty() {
            return Err(invalid("isolatedRuntimeName is empty"));
        }
        if self.entrypoint_template.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(invalid("entrypointTemplate is empty"));
        }
        Ok(())
    }
}

/// Read-only map from language identifier to profile.
///
/// # Example
///
/// ```
/// use code_sandbox::sandbox::{ExecutionProfile, RuntimeRegistry};
///
/// let mut registry = RuntimeRegistry::builtin();
/// registry
///     .register(ExecutionProfile::new("ruby", "rb", "ruby:3.3-alpine", ["ruby", "{file}"]))
///     .unwrap();
///
/// assert_eq!(registry.resolve("ruby").unwrap().file_extension, "rb");
/// assert!(registry.resolve("cobol").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    profiles: BTreeMap<String, ExecutionProfile>,
    aliases: HashMap<String, String>,
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuntimeRegistry {
    /// Creates a registry with no languages.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            profiles: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in `python` and `javascript` profiles.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for profile in builtin_profiles() {
            registry.insert(profile);
        }
        registry
    }

    /// Adds a profile, replacing any profile for the same language.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidProfile` if the profile is incomplete.
    pub fn register(&mut self, profile: ExecutionProfile) -> Result<(), RegistryError> {
        profile.validate()?;
        self.insert(profile);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidProfile` if the profile is incomplete.
    pub fn with_profile(mut self, profile: ExecutionProfile) -> Result<Self, RegistryError> {
        self.register(profile)?;
        Ok(self)
    }

    fn insert(&mut self, profile: ExecutionProfile) {
        if let Some(previous) = self.profiles.remove(&profile.language) {
            self.aliases.retain(|_, language| *language != previous.language);
        }
        for alias in &profile.aliases {
            self.aliases.insert(alias.clone(), profile.language.clone());
        }
        self.profiles.insert(profile.language.clone(), profile);
    }

    /// Looks up the profile for a language identifier or alias.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnsupportedLanguage` for unknown identifiers.
    pub fn resolve(&self, language: &str) -> Result<&ExecutionProfile, RegistryError> {
        let key = self
            .aliases
            .get(language)
            .map_or(language, String::as_str);

        self.profiles
            .get(key)
            .ok_or_else(|| RegistryError::UnsupportedLanguage {
                language: language.to_string(),
            })
    }

    /// Registered language identifiers, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Number of registered languages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Returns true if no language is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Merges the profiles of a JSON profile file into this registry.
    ///
    /// Returns the number of profiles loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or contains an
    /// invalid profile. Nothing is registered in that case.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let profiles = load_profiles(path)?;
        for profile in &profiles {
            profile.validate()?;
        }

        let count = profiles.len();
        for profile in profiles {
            debug!(language = %profile.language, image = %profile.isolated_runtime_name, "Registering profile");
            self.insert(profile);
        }
        Ok(count)
    }
}

/// Reads a JSON array of profiles.
///
/// # Errors
///
/// Returns `ReadFailed` or `ParseFailed`.
pub fn load_profiles(path: &Path) -> Result<Vec<ExecutionProfile>, RegistryError> {
    let content = fs::read_to_string(path).map_err(|e| RegistryError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| RegistryError::ParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn builtin_profiles() -> [ExecutionProfile; 2] {
    [
        ExecutionProfile::new("python", "py", "python:3.11-slim", ["python3", "-u", "{file}"])
            .with_alias("py")
            .with_alias("python3"),
        ExecutionProfile::new("javascript", "js", "node:20-alpine", ["node", "{file}"])
            .with_alias("js")
            .with_alias("node"),
    ]
}
