//! Service account and the directories the terminal service owns.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::layout::{
    APP_ROOT, SERVICE_GID, SERVICE_HOME, SERVICE_SHELL, SERVICE_UID, SERVICE_USER, WEB_ROOT,
};

/// Directories owned by the service account, relative to the staging root.
pub const SERVICE_DIRS: &[&str] = &[WEB_ROOT, APP_ROOT, "var/log/lighttpd", "run/lighttpd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAccount {
    pub uid: u32,
    pub gid: u32,
}

/// The ids a freshly created account gets.
impl Default for ServiceAccount {
    fn default() -> Self {
        Self {
            uid: SERVICE_UID,
            gid: SERVICE_GID,
        }
    }
}

/// Find `name` in a colon-separated database and parse field `index` as an id.
///
/// - `Ok(None)`: no such entry
/// - `Err`: the entry exists but the id is not a number
fn lookup_id(content: &str, name: &str, index: usize, file: &Path) -> Result<Option<u32>> {
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() > index && parts[0] == name {
            let id = parts[index].parse().with_context(|| {
                format!(
                    "Corrupted {}: invalid id '{}' for '{}'",
                    file.display(),
                    parts[index],
                    name
                )
            })?;
            return Ok(Some(id));
        }
    }
    Ok(None)
}

fn read_db(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn append_entry(path: &Path, mut content: String, entry: &str) -> Result<()> {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(entry);
    content.push('\n');
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Ensure the group exists. Returns its gid (an existing entry wins).
pub fn ensure_group(root: &Path, name: &str, default_gid: u32) -> Result<u32> {
    let path = root.join("etc/group");
    let content = read_db(&path)?;
    if let Some(gid) = lookup_id(&content, name, 2, &path)? {
        return Ok(gid);
    }
    append_entry(&path, content, &format!("{}:x:{}:", name, default_gid))?;
    Ok(default_gid)
}

/// Ensure the user exists. Returns (uid, gid) (an existing entry wins).
pub fn ensure_user(
    root: &Path,
    name: &str,
    uid: u32,
    gid: u32,
    home: &str,
    shell: &str,
) -> Result<(u32, u32)> {
    let path = root.join("etc/passwd");
    let content = read_db(&path)?;
    if let Some(existing_uid) = lookup_id(&content, name, 2, &path)? {
        let existing_gid = lookup_id(&content, name, 3, &path)?.unwrap_or(gid);
        return Ok((existing_uid, existing_gid));
    }
    append_entry(
        &path,
        content,
        &format!("{}:x:{}:{}:{}:{}:{}", name, uid, gid, name, home, shell),
    )?;
    Ok((uid, gid))
}

/// Ensure a locked shadow entry (no password login).
pub fn ensure_shadow(root: &Path, name: &str) -> Result<()> {
    let path = root.join("etc/shadow");
    let content = read_db(&path)?;
    let prefix = format!("{}:", name);
    if content.lines().any(|l| l.starts_with(&prefix)) {
        return Ok(());
    }
    let existed = path.exists();
    append_entry(&path, content, &format!("{}:!:0:0:99999:7:::", name))?;
    if !existed {
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640))?;
    }
    Ok(())
}

/// Create the unprivileged service account.
pub fn ensure_service_account(root: &Path) -> Result<ServiceAccount> {
    let gid = ensure_group(root, SERVICE_USER, SERVICE_GID)?;
    let (uid, gid) = ensure_user(root, SERVICE_USER, SERVICE_UID, gid, SERVICE_HOME, SERVICE_SHELL)?;
    ensure_shadow(root, SERVICE_USER)?;
    tracing::info!("Service account '{}' uid={} gid={}", SERVICE_USER, uid, gid);
    Ok(ServiceAccount { uid, gid })
}

/// Create the service directories, mode 0750, owned by the account.
///
/// Ownership is only applied when running as root; unprivileged runs (tests)
/// get the directories with the invoking user as owner.
pub fn create_service_dirs(root: &Path, account: ServiceAccount) -> Result<()> {
    let privileged = nix::unistd::geteuid().is_root();
    if !privileged {
        tracing::warn!("Not running as root, service directories keep the invoking owner");
    }

    for dir in SERVICE_DIRS {
        let path = root.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o750))?;
        if privileged {
            chown_tree(&path, account)?;
        }
    }
    Ok(())
}

/// Recursively chown a tree to the service account.
pub fn chown_tree(path: &Path, account: ServiceAccount) -> Result<()> {
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
        std::os::unix::fs::lchown(entry.path(), Some(account.uid), Some(account.gid))
            .with_context(|| format!("Failed to chown {}", entry.path().display()))?;
    }
    Ok(())
}
