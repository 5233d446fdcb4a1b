//! Feature resolution: raw flag file → validated [`BuildConfig`] →
//! deterministic [`ComponentManifest`].
//!
//! Resolution is pure. Nothing here touches the network or the workspace, so
//! a bad flag combination is always rejected before the build has any side
//! effect.
//!
//! The flag file uses the same dotenv syntax as the builder's `.env`:
//!
//! ```text
//! # features.env
//! discovery=false
//! runtime=true
//! database=true
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;

use crate::error::ConfigError;
use crate::init::{catalog, Fragment};
use crate::layout::{MEMORY_MB_DATABASE, MEMORY_MB_DEFAULT};

/// Optional image components, in their fixed boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// mDNS/DNS-SD announcement (avahi + dbus).
    Discovery,
    /// Lightweight API process (nodejs).
    Runtime,
    /// Volatile local database (postgresql).
    Database,
}

impl Feature {
    /// All features in rank order.
    pub const ALL: [Feature; 3] = [Feature::Discovery, Feature::Runtime, Feature::Database];

    /// Flag key in the feature file.
    pub fn key(self) -> &'static str {
        match self {
            Feature::Discovery => "discovery",
            Feature::Runtime => "runtime",
            Feature::Database => "database",
        }
    }

    pub fn from_key(key: &str) -> Option<Feature> {
        let key = key.trim().to_ascii_lowercase();
        let key = key.strip_prefix("enable_").unwrap_or(&key);
        Feature::ALL.into_iter().find(|f| f.key() == key)
    }

    /// Features that must also be enabled.
    pub fn requires(self) -> &'static [Feature] {
        match self {
            Feature::Database => &[Feature::Runtime],
            Feature::Discovery | Feature::Runtime => &[],
        }
    }

    /// Alpine packages installed when the feature is on.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            Feature::Discovery => &["avahi", "dbus"],
            Feature::Runtime => &["nodejs"],
            Feature::Database => &["postgresql16", "postgresql16-client"],
        }
    }
}

/// Recognised flags as read from the feature file. Missing keys are off.
pub type RawFlags = BTreeMap<Feature, bool>;

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "1" => Ok(true),
        "false" | "no" | "n" | "off" | "0" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn collect_flags<I>(pairs: I) -> Result<RawFlags, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut flags = RawFlags::new();
    for (key, value) in pairs {
        match Feature::from_key(&key) {
            Some(feature) => {
                flags.insert(feature, parse_bool(&key, &value)?);
            }
            None => tracing::debug!("Ignoring unrecognised feature flag '{}'", key),
        }
    }
    Ok(flags)
}

/// Parse a feature file. A missing file means "all optional components off".
///
/// That fallback is logged as a warning: a mistyped `--features` path would
/// otherwise silently build the minimal image.
pub fn parse_flag_file(path: &Path) -> Result<RawFlags, ConfigError> {
    if !path.exists() {
        tracing::warn!(
            "Feature file {} not found, building with all optional components off",
            path.display()
        );
        return Ok(RawFlags::new());
    }

    let unreadable = |reason: String| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };

    let iter = dotenvy::from_path_iter(path).map_err(|e| unreadable(e.to_string()))?;
    let pairs = iter
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| unreadable(e.to_string()))?;
    collect_flags(pairs)
}

/// Parse feature flags from dotenv-formatted text.
pub fn parse_flag_str(text: &str) -> Result<RawFlags, ConfigError> {
    let iter = dotenvy::from_read_iter(text.as_bytes());
    let pairs = iter
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Unreadable {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
    collect_flags(pairs)
}

/// Validated, immutable feature selection for one build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildConfig {
    enabled: BTreeSet<Feature>,
}

impl BuildConfig {
    /// Validate raw flags. Missing flags default to off.
    pub fn resolve(raw: &RawFlags) -> Result<Self, ConfigError> {
        Self::from_features(
            raw.iter()
                .filter(|(_, on)| **on)
                .map(|(feature, _)| *feature),
        )
    }

    /// Parse and validate a feature file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(&parse_flag_file(path)?)
    }

    /// Validate an explicit feature set.
    pub fn from_features<I>(features: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Feature>,
    {
        let enabled: BTreeSet<Feature> = features.into_iter().collect();

        for feature in &enabled {
            for required in feature.requires() {
                if !enabled.contains(required) {
                    return Err(ConfigError::UnmetDependency {
                        feature: feature.key(),
                        requires: required.key(),
                    });
                }
            }
        }

        Ok(Self { enabled })
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    /// Enabled features in rank order.
    pub fn features(&self) -> impl Iterator<Item = Feature> + '_ {
        self.enabled.iter().copied()
    }

    /// Emulator memory budget for this image.
    pub fn memory_mb(&self) -> u32 {
        if self.is_enabled(Feature::Database) {
            MEMORY_MB_DATABASE
        } else {
            MEMORY_MB_DEFAULT
        }
    }

    /// Derive the component manifest. Order is fixed by feature rank.
    pub fn manifest(&self) -> ComponentManifest {
        let components = Feature::ALL
            .into_iter()
            .filter(|f| self.is_enabled(*f))
            .map(ComponentDescriptor::for_feature)
            .collect();
        ComponentManifest { components }
    }
}

/// One optional component of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentDescriptor {
    pub name: &'static str,
    pub feature: Feature,
    pub packages: BTreeSet<String>,
    pub init_fragment: Option<Fragment>,
}

impl ComponentDescriptor {
    fn for_feature(feature: Feature) -> Self {
        Self {
            name: feature.key(),
            feature,
            packages: feature.packages().iter().map(|p| p.to_string()).collect(),
            init_fragment: Some(catalog::optional(feature)),
        }
    }
}

/// Ordered components derived from a [`BuildConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ComponentManifest {
    pub components: Vec<ComponentDescriptor>,
}

impl ComponentManifest {
    pub fn iter(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name).collect()
    }

    /// Union of all component package sets, sorted.
    pub fn packages(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .flat_map(|c| c.packages.iter().cloned())
            .collect()
    }

    /// Canonical JSON form (used for byte-level comparisons and `show`).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_flags_default_off() {
        let cfg = BuildConfig::resolve(&RawFlags::new()).unwrap();
        assert!(cfg.manifest().is_empty());
        assert_eq!(cfg.memory_mb(), MEMORY_MB_DEFAULT);
    }

    #[test]
    fn test_database_without_runtime_rejected() {
        let raw = parse_flag_str("database=true\nruntime=false\n").unwrap();
        let err = BuildConfig::resolve(&raw).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnmetDependency {
                feature: "database",
                requires: "runtime"
            }
        );
    }

    #[test]
    fn test_database_with_runtime_accepted() {
        let raw = parse_flag_str("runtime=yes\ndatabase=1\n").unwrap();
        let cfg = BuildConfig::resolve(&raw).unwrap();
        assert_eq!(cfg.manifest().names(), vec!["runtime", "database"]);
        assert_eq!(cfg.memory_mb(), MEMORY_MB_DATABASE);
    }

    #[test]
    fn test_key_normalisation_and_unknown_keys() {
        let raw = parse_flag_str("ENABLE_DISCOVERY=on\nColor=blue\n").unwrap();
        assert_eq!(raw.get(&Feature::Discovery), Some(&true));
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let err = parse_flag_str("runtime=maybe\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_manifest_independent_of_input_order() {
        let a = parse_flag_str("database=true\nruntime=true\ndiscovery=true\n").unwrap();
        let b = parse_flag_str("discovery=true\nruntime=true\ndatabase=true\n").unwrap();
        let ma = BuildConfig::resolve(&a).unwrap().manifest();
        let mb = BuildConfig::resolve(&b).unwrap().manifest();
        assert_eq!(ma.to_json().unwrap(), mb.to_json().unwrap());
        assert_eq!(ma.names(), vec!["discovery", "runtime", "database"]);
    }

    #[test]
    fn test_package_union_sorted() {
        let cfg = BuildConfig::from_features([Feature::Database, Feature::Runtime]).unwrap();
        let pkgs: Vec<String> = cfg.manifest().packages().into_iter().collect();
        assert_eq!(pkgs, vec!["nodejs", "postgresql16", "postgresql16-client"]);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let raw = parse_flag_file(Path::new("/nonexistent/features.env")).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn test_every_descriptor_has_fragment() {
        let cfg = BuildConfig::from_features(Feature::ALL).unwrap();
        assert!(cfg.manifest().iter().all(|c| c.init_fragment.is_some()));
    }
}
