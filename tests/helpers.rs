//! Shared test utilities for monoboot tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use monoboot::config::Config;
use monoboot::features::{BuildConfig, Feature};

/// Temporary project directory with a config pointing into it.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Project root simulation; holds features.env, build/ and output/
    pub base_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();
        Self {
            _temp_dir: temp_dir,
            base_dir,
        }
    }

    /// Write `features.env` with the given contents.
    pub fn write_features(&self, contents: &str) -> PathBuf {
        let path = self.base_dir.join("features.env");
        fs::write(&path, contents).expect("Failed to write features.env");
        path
    }

    /// Config with defaults resolved against this directory; no process env.
    pub fn config(&self) -> Config {
        Config::from_vars(&self.base_dir, &HashMap::new())
    }

    /// Like [`TestEnv::config`] with the given `MONOBOOT_*` overrides.
    pub fn config_with(&self, vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(&self.base_dir, &vars)
    }
}

/// All 2^3 raw flag combinations, valid or not.
pub fn all_flag_combinations() -> Vec<Vec<Feature>> {
    (0u8..8)
        .map(|mask| {
            Feature::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, f)| *f)
                .collect()
        })
        .collect()
}

pub fn build_config(features: &[Feature]) -> BuildConfig {
    BuildConfig::from_features(features.iter().copied()).expect("valid feature set")
}

pub fn assert_file_contains(path: &Path, pattern: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    assert!(
        content.contains(pattern),
        "File {} should contain '{}', got:\n{}",
        path.display(),
        pattern,
        content
    );
}
