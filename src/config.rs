//! Configuration management for monoboot.
//!
//! Reads configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file.
//!
//! This is the *builder's* configuration (where to work, which mirror to use).
//! The image's feature flags live in a separate file, see [`crate::features`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::layout::IMAGE_FILENAME;

/// Default Alpine mirror.
pub const DEFAULT_ALPINE_MIRROR: &str = "https://dl-cdn.alpinelinux.org/alpine";
/// Pinned Alpine release for the base root filesystem.
pub const DEFAULT_ALPINE_VERSION: &str = "3.20.3";
pub const DEFAULT_ALPINE_ARCH: &str = "x86_64";

/// monoboot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace root (default: build/)
    pub workspace: PathBuf,
    /// Final artifact path (default: output/monoboot.iso)
    pub output: PathBuf,
    /// Feature flag file (default: features.env)
    pub features: PathBuf,
    /// Alpine mirror base URL
    pub alpine_mirror: String,
    /// Alpine release, e.g. "3.20.3"
    pub alpine_version: String,
    /// Alpine architecture
    pub alpine_arch: String,
    /// Static site copied into the web root
    pub site_dir: Option<PathBuf>,
    /// API process and seed data copied into the app root
    pub app_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `base_dir/.env` and the process environment.
    pub fn load(base_dir: &Path) -> Self {
        let mut vars: HashMap<String, String> = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            match dotenvy::from_path_iter(&env_path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                vars.insert(key, value);
                            }
                            Err(e) => {
                                tracing::warn!("Ignoring malformed line in {}: {}", env_path.display(), e)
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!("Could not read {}: {}", env_path.display(), e),
            }
        }

        // Environment variables override .env file
        vars.extend(std::env::vars());

        Self::from_vars(base_dir, &vars)
    }

    /// Build a config from an explicit variable map.
    pub fn from_vars(base_dir: &Path, vars: &HashMap<String, String>) -> Self {
        let path = |key: &str| {
            vars.get(key).filter(|s| !s.is_empty()).map(|s| {
                let p = PathBuf::from(s);
                if p.is_absolute() {
                    p
                } else {
                    base_dir.join(p)
                }
            })
        };
        let string = |key: &str, default: &str| {
            vars.get(key)
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            workspace: path("MONOBOOT_WORKSPACE").unwrap_or_else(|| base_dir.join("build")),
            output: path("MONOBOOT_OUTPUT")
                .unwrap_or_else(|| base_dir.join("output").join(IMAGE_FILENAME)),
            features: path("MONOBOOT_FEATURES").unwrap_or_else(|| base_dir.join("features.env")),
            alpine_mirror: string("ALPINE_MIRROR", DEFAULT_ALPINE_MIRROR)
                .trim_end_matches('/')
                .to_string(),
            alpine_version: string("ALPINE_VERSION", DEFAULT_ALPINE_VERSION),
            alpine_arch: string("ALPINE_ARCH", DEFAULT_ALPINE_ARCH),
            site_dir: path("MONOBOOT_SITE_DIR"),
            app_dir: path("MONOBOOT_APP_DIR"),
        }
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  MONOBOOT_WORKSPACE: {}", self.workspace.display());
        println!("  MONOBOOT_OUTPUT:    {}", self.output.display());
        println!("  MONOBOOT_FEATURES:  {}", self.features.display());
        println!("  ALPINE_MIRROR:      {}", self.alpine_mirror);
        println!("  ALPINE_VERSION:     {}", self.alpine_version);
        println!("  ALPINE_ARCH:        {}", self.alpine_arch);
        match &self.site_dir {
            Some(dir) => println!("  MONOBOOT_SITE_DIR:  {}", dir.display()),
            None => println!("  MONOBOOT_SITE_DIR:  (unset, placeholder page)"),
        }
        match &self.app_dir {
            Some(dir) => println!("  MONOBOOT_APP_DIR:   {}", dir.display()),
            None => println!("  MONOBOOT_APP_DIR:   (unset)"),
        }
        if self.features.exists() {
            println!("  Feature file: FOUND");
        } else {
            println!("  Feature file: NOT FOUND (all optional components off)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let base = Path::new("/work");
        let cfg = Config::from_vars(base, &HashMap::new());
        assert_eq!(cfg.workspace, PathBuf::from("/work/build"));
        assert_eq!(cfg.output, PathBuf::from("/work/output/monoboot.iso"));
        assert_eq!(cfg.features, PathBuf::from("/work/features.env"));
        assert_eq!(cfg.alpine_version, DEFAULT_ALPINE_VERSION);
        assert!(cfg.site_dir.is_none());
    }

    #[test]
    fn test_relative_and_absolute_paths() {
        let base = Path::new("/work");
        let cfg = Config::from_vars(
            base,
            &vars(&[
                ("MONOBOOT_WORKSPACE", "scratch"),
                ("MONOBOOT_OUTPUT", "/srv/out/img.iso"),
                ("ALPINE_MIRROR", "https://mirror.example/alpine/"),
            ]),
        );
        assert_eq!(cfg.workspace, PathBuf::from("/work/scratch"));
        assert_eq!(cfg.output, PathBuf::from("/srv/out/img.iso"));
        assert_eq!(cfg.alpine_mirror, "https://mirror.example/alpine");
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let cfg = Config::from_vars(Path::new("/w"), &vars(&[("ALPINE_ARCH", "")]));
        assert_eq!(cfg.alpine_arch, DEFAULT_ALPINE_ARCH);
    }

    #[test]
    #[serial]
    fn test_env_overrides_dotenv_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "ALPINE_VERSION=3.19.1\nMONOBOOT_APP_DIR=app\n",
        )
        .unwrap();

        std::env::set_var("ALPINE_VERSION", "3.20.9");
        let cfg = Config::load(dir.path());
        std::env::remove_var("ALPINE_VERSION");

        assert_eq!(cfg.alpine_version, "3.20.9");
        assert_eq!(cfg.app_dir, Some(dir.path().join("app")));
    }
}
