//! Terminal service provisioning: lighttpd config, site and app content.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use walkdir::WalkDir;

use crate::features::{BuildConfig, Feature};
use crate::layout::{
    APP_ROOT, LIGHTTPD_CONF, RUNTIME_PORT, SERVICE_PORT, SERVICE_USER, WEB_ROOT,
};

const PLACEHOLDER_INDEX: &str = "<!doctype html>
<html>
<head><meta charset=\"utf-8\"><title>monoboot</title></head>
<body><h1>It boots.</h1><p>Set MONOBOOT_SITE_DIR to serve your own content.</p></body>
</html>
";

/// Render lighttpd.conf for this image.
pub fn render_lighttpd_conf(config: &BuildConfig) -> String {
    let runtime = config.is_enabled(Feature::Runtime);
    let mut out = String::new();

    let modules = if runtime {
        r#""mod_access", "mod_proxy""#
    } else {
        r#""mod_access""#
    };
    let _ = writeln!(out, "server.modules = ( {} )", modules);
    let _ = writeln!(out, "server.document-root = \"/{}\"", WEB_ROOT);
    let _ = writeln!(out, "server.port = {}", SERVICE_PORT);
    let _ = writeln!(out, "server.username = \"{}\"", SERVICE_USER);
    let _ = writeln!(out, "server.groupname = \"{}\"", SERVICE_USER);
    let _ = writeln!(out, "server.errorlog = \"/var/log/lighttpd/error.log\"");
    let _ = writeln!(out, "server.pid-file = \"/run/lighttpd/lighttpd.pid\"");
    let _ = writeln!(out, "server.tag = \"\"");
    let _ = writeln!(out, "dir-listing.activate = \"disable\"");
    let _ = writeln!(out, "index-file.names = ( \"index.html\" )");
    out.push_str(
        r#"mimetype.assign = (
    ".html" => "text/html",
    ".css" => "text/css",
    ".js" => "application/javascript",
    ".json" => "application/json",
    ".svg" => "image/svg+xml",
    ".png" => "image/png",
    ".txt" => "text/plain",
    "" => "text/plain"
)
"#,
    );

    if runtime {
        let _ = writeln!(out, "$HTTP[\"url\"] =~ \"^/api/\" {{");
        let _ = writeln!(
            out,
            "    proxy.server = ( \"\" => (( \"host\" => \"127.0.0.1\", \"port\" => {} )) )",
            RUNTIME_PORT
        );
        let _ = writeln!(out, "}}");
    }
    out
}

pub fn write_lighttpd_conf(root: &Path, config: &BuildConfig) -> Result<()> {
    let path = root.join(LIGHTTPD_CONF);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, render_lighttpd_conf(config))
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Copy a directory tree, keeping symlinks as symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    if !src.is_dir() {
        bail!("{} is not a directory", src.display());
    }
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Populate the web root. Without a site directory a placeholder page is
/// written. A `health` file is always present for the smoke test.
pub fn install_site(root: &Path, site_dir: Option<&Path>) -> Result<()> {
    let web_root = root.join(WEB_ROOT);
    fs::create_dir_all(&web_root)?;
    match site_dir {
        Some(dir) => {
            let n = copy_tree(dir, &web_root)
                .with_context(|| format!("Failed to copy site from {}", dir.display()))?;
            tracing::info!("Copied {} site files from {}", n, dir.display());
        }
        None => {
            fs::write(web_root.join("index.html"), PLACEHOLDER_INDEX)?;
        }
    }
    let health = web_root.join("health");
    if !health.exists() {
        fs::write(&health, "ok\n")?;
    }
    Ok(())
}

/// Copy the API process (and optional seed data) into the app root.
pub fn install_app(root: &Path, app_dir: Option<&Path>, config: &BuildConfig) -> Result<()> {
    let Some(dir) = app_dir else {
        if config.is_enabled(Feature::Runtime) {
            tracing::warn!("runtime is enabled but MONOBOOT_APP_DIR is unset; the API process will not start");
        }
        return Ok(());
    };
    let app_root = root.join(APP_ROOT);
    fs::create_dir_all(&app_root)?;
    let n = copy_tree(dir, &app_root)
        .with_context(|| format!("Failed to copy app from {}", dir.display()))?;
    tracing::info!("Copied {} app files from {}", n, dir.display());
    Ok(())
}

/// The root image is read-only; dbus and avahi read the machine id from the
/// tmpfs copy generated at boot.
pub fn link_machine_id(root: &Path) -> Result<()> {
    let path = root.join("etc/machine-id");
    if path.symlink_metadata().is_ok() {
        fs::remove_file(&path)?;
    }
    symlink("/run/machine-id", &path)
        .with_context(|| format!("Failed to link {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_without_runtime_has_no_proxy() {
        let conf = render_lighttpd_conf(&BuildConfig::default());
        assert!(conf.contains("server.port = 80"));
        assert!(conf.contains("server.document-root = \"/srv/www\""));
        assert!(!conf.contains("proxy.server"));
    }

    #[test]
    fn test_conf_with_runtime_proxies_api_to_localhost() {
        let cfg = BuildConfig::from_features([Feature::Runtime]).unwrap();
        let conf = render_lighttpd_conf(&cfg);
        assert!(conf.contains("\"mod_proxy\""));
        assert!(conf.contains("\"host\" => \"127.0.0.1\", \"port\" => 3000"));
    }

    #[test]
    fn test_placeholder_site() {
        let dir = tempfile::tempdir().unwrap();
        install_site(dir.path(), None).unwrap();
        assert!(dir.path().join("srv/www/index.html").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("srv/www/health")).unwrap(),
            "ok\n"
        );
    }

    #[test]
    fn test_site_copy_keeps_layout() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("css")).unwrap();
        fs::write(src.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(src.path().join("css/site.css"), "body{}").unwrap();
        symlink("index.html", src.path().join("home.html")).unwrap();

        let root = tempfile::tempdir().unwrap();
        install_site(root.path(), Some(src.path())).unwrap();
        let web = root.path().join("srv/www");
        assert_eq!(fs::read_to_string(web.join("index.html")).unwrap(), "<h1>hi</h1>");
        assert!(web.join("css/site.css").exists());
        assert!(web.join("home.html").symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_machine_id_points_at_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/machine-id"), "stale").unwrap();
        link_machine_id(dir.path()).unwrap();
        assert_eq!(
            fs::read_link(dir.path().join("etc/machine-id")).unwrap(),
            Path::new("/run/machine-id")
        );
    }
}
