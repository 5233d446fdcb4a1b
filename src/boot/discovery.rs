//! Stage 1: find the device carrying the root image and switch to it.
//!
//! [`Discovery`] is the model of the scan; [`render_stage1`] produces the
//! `/init` shipped in the initramfs from the same policy and paths.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::error::BootError;
use crate::layout::{ISO_ROOTFS_PATH, STAGE1_MEDIA_MOUNT, STAGE1_NEWROOT, STAGE2_PATH};

/// Bounded scan: hardware may enumerate asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    Scanning { attempt: u32 },
    Mounted(String),
    Failed,
}

/// Access to block devices during discovery.
pub trait DeviceProbe {
    /// Block devices present right now, in kernel enumeration order.
    fn enumerate(&mut self) -> Vec<String>;
    /// Whether the device holds a root image with the expected signature.
    fn carries_signature(&mut self, device: &str) -> bool;
    /// Mount the root image from `device` read-only.
    fn mount_root(&mut self, device: &str) -> Result<(), String>;
    fn wait(&mut self, delay: Duration);
}

#[derive(Debug)]
pub struct Discovery {
    policy: ScanPolicy,
    state: DiscoveryState,
}

impl Discovery {
    pub fn new(policy: ScanPolicy) -> Self {
        Self {
            policy,
            state: DiscoveryState::Scanning { attempt: 0 },
        }
    }

    pub fn state(&self) -> &DiscoveryState {
        &self.state
    }

    /// Scan until a device is mounted or the attempts run out.
    ///
    /// At most one device is ever mounted: the first one that carries the
    /// signature and mounts successfully.
    pub fn run<P: DeviceProbe>(&mut self, probe: &mut P) -> Result<String, BootError> {
        for attempt in 1..=self.policy.attempts {
            self.state = DiscoveryState::Scanning { attempt };

            for device in probe.enumerate() {
                if !probe.carries_signature(&device) {
                    continue;
                }
                match probe.mount_root(&device) {
                    Ok(()) => {
                        tracing::info!("Root image found on {} (attempt {})", device, attempt);
                        self.state = DiscoveryState::Mounted(device.clone());
                        return Ok(device);
                    }
                    Err(reason) => {
                        tracing::warn!("{} carries the signature but did not mount: {}", device, reason)
                    }
                }
            }

            if attempt < self.policy.attempts {
                probe.wait(self.policy.delay);
            }
        }

        self.state = DiscoveryState::Failed;
        Err(BootError::DiscoveryExhausted {
            attempts: self.policy.attempts,
        })
    }
}

/// Device globs probed by the shipped `/init`.
pub const DEVICE_GLOBS: &[&str] = &["/dev/sr*", "/dev/vd*", "/dev/sd*", "/dev/hd*", "/dev/nvme*n*"];

/// Render the initramfs `/init`.
///
/// Only the busybox applets linked into the initramfs are used; everything
/// else is an ash builtin.
pub fn render_stage1(policy: &ScanPolicy, modules: &[&str]) -> String {
    let media = STAGE1_MEDIA_MOUNT;
    let newroot = STAGE1_NEWROOT;
    let mut s = String::new();

    let _ = writeln!(s, "#!/bin/sh");
    let _ = writeln!(s, "# monoboot stage 1 (generated, do not edit)");
    let _ = writeln!(s, "PATH=/bin");
    let _ = writeln!(s, "export PATH");
    s.push('\n');
    let _ = writeln!(s, "log() {{ echo \"monoboot stage1: $*\" > /dev/console 2> /dev/null || echo \"monoboot stage1: $*\"; }}");
    s.push('\n');
    s.push_str(
        "halt() {\n    log \"$1. Halting (no recovery shell).\"\n    while :; do sleep 3600; done\n}\n\n",
    );

    let _ = writeln!(s, "mkdir -p /proc /sys /dev {media} {newroot}");
    let _ = writeln!(s, "mount -t proc -o nosuid,nodev,noexec proc /proc");
    let _ = writeln!(s, "mount -t sysfs -o nosuid,nodev,noexec sysfs /sys");
    let _ = writeln!(s, "mount -t devtmpfs -o nosuid,mode=0755 devtmpfs /dev");
    s.push('\n');

    if !modules.is_empty() {
        let _ = writeln!(s, "for m in {}; do", modules.join(" "));
        let _ = writeln!(s, "    modprobe \"$m\" 2> /dev/null || log \"module $m not loaded\"");
        let _ = writeln!(s, "done");
        s.push('\n');
    }

    // Signature check with builtins only: the first four bytes of the image.
    let _ = writeln!(s, "carries_root() {{");
    let _ = writeln!(s, "    [ -f \"$1\" ] || return 1");
    let _ = writeln!(s, "    magic=");
    let _ = writeln!(s, "    IFS= read -r -n 4 magic < \"$1\" 2> /dev/null");
    let _ = writeln!(s, "    [ \"$magic\" = \"hsqs\" ]");
    let _ = writeln!(s, "}}");
    s.push('\n');

    let _ = writeln!(s, "probe() {{");
    let _ = writeln!(s, "    for dev in {}; do", DEVICE_GLOBS.join(" "));
    let _ = writeln!(s, "        [ -b \"$dev\" ] || continue");
    let _ = writeln!(s, "        mount -o ro \"$dev\" {media} 2> /dev/null || continue");
    let _ = writeln!(s, "        if carries_root {media}/{ISO_ROOTFS_PATH}; then");
    let _ = writeln!(s, "            FOUND=\"$dev\"");
    let _ = writeln!(s, "            return 0");
    let _ = writeln!(s, "        fi");
    let _ = writeln!(s, "        umount {media}");
    let _ = writeln!(s, "    done");
    let _ = writeln!(s, "    return 1");
    let _ = writeln!(s, "}}");
    s.push('\n');

    let _ = writeln!(s, "FOUND=");
    let _ = writeln!(s, "attempt=1");
    let _ = writeln!(s, "while [ \"$attempt\" -le {} ]; do", policy.attempts);
    let _ = writeln!(s, "    probe && break");
    let _ = writeln!(s, "    [ \"$attempt\" -lt {} ] && sleep {}", policy.attempts, policy.delay.as_secs().max(1));
    let _ = writeln!(s, "    attempt=$((attempt + 1))");
    let _ = writeln!(s, "done");
    let _ = writeln!(
        s,
        "[ -n \"$FOUND\" ] || halt \"no device carried the root image after {} attempts\"",
        policy.attempts
    );
    let _ = writeln!(s, "log \"root image on $FOUND\"");
    s.push('\n');

    let _ = writeln!(s, "LOOP=$(losetup -f) || halt \"no free loop device\"");
    let _ = writeln!(s, "losetup -r \"$LOOP\" {media}/{ISO_ROOTFS_PATH} || halt \"losetup failed\"");
    let _ = writeln!(s, "mount -t squashfs -o ro \"$LOOP\" {newroot} || halt \"cannot mount root image\"");
    s.push('\n');

    let _ = writeln!(s, "for fs in dev proc sys; do");
    let _ = writeln!(s, "    mount -o move \"/$fs\" \"{newroot}/$fs\" 2> /dev/null || umount \"/$fs\"");
    let _ = writeln!(s, "done");
    s.push('\n');
    let _ = writeln!(s, "exec switch_root {newroot} /{STAGE2_PATH}");
    let _ = writeln!(s, "halt \"switch_root failed\"");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct FakeBus {
        /// Devices per attempt; the last entry repeats.
        waves: Vec<Vec<&'static str>>,
        signed: BTreeSet<&'static str>,
        broken: BTreeSet<&'static str>,
        calls: usize,
        mounted: Vec<String>,
        waits: u32,
    }

    impl FakeBus {
        fn new(waves: Vec<Vec<&'static str>>, signed: &[&'static str]) -> Self {
            Self {
                waves,
                signed: signed.iter().copied().collect(),
                broken: BTreeSet::new(),
                calls: 0,
                mounted: Vec::new(),
                waits: 0,
            }
        }
    }

    impl DeviceProbe for FakeBus {
        fn enumerate(&mut self) -> Vec<String> {
            let idx = self.calls.min(self.waves.len() - 1);
            self.calls += 1;
            self.waves[idx].iter().map(|d| d.to_string()).collect()
        }
        fn carries_signature(&mut self, device: &str) -> bool {
            self.signed.contains(device)
        }
        fn mount_root(&mut self, device: &str) -> Result<(), String> {
            if self.broken.contains(device) {
                return Err("I/O error".into());
            }
            self.mounted.push(device.to_string());
            Ok(())
        }
        fn wait(&mut self, _delay: Duration) {
            self.waits += 1;
        }
    }

    #[test]
    fn test_late_device_found_on_later_attempt() {
        let mut bus = FakeBus::new(vec![vec![], vec!["/dev/vda"], vec!["/dev/vda", "/dev/sr0"]], &["/dev/sr0"]);
        let mut d = Discovery::new(ScanPolicy::default());
        assert_eq!(d.run(&mut bus).unwrap(), "/dev/sr0");
        assert_eq!(d.state(), &DiscoveryState::Mounted("/dev/sr0".into()));
        assert_eq!(bus.waits, 2);
        assert_eq!(bus.mounted, vec!["/dev/sr0"]);
    }

    #[test]
    fn test_exhausted_scan_fails_closed() {
        let mut bus = FakeBus::new(vec![vec!["/dev/vda", "/dev/vdb"]], &[]);
        let mut d = Discovery::new(ScanPolicy::default());
        let err = d.run(&mut bus).unwrap_err();
        assert_eq!(err, BootError::DiscoveryExhausted { attempts: 10 });
        assert_eq!(d.state(), &DiscoveryState::Failed);
        assert_eq!(bus.calls, 10);
        // No wait after the final attempt.
        assert_eq!(bus.waits, 9);
        assert!(bus.mounted.is_empty());
    }

    #[test]
    fn test_unmountable_candidate_is_skipped() {
        let mut bus = FakeBus::new(vec![vec!["/dev/sr0", "/dev/sr1"]], &["/dev/sr0", "/dev/sr1"]);
        bus.broken.insert("/dev/sr0");
        let mut d = Discovery::new(ScanPolicy::default());
        assert_eq!(d.run(&mut bus).unwrap(), "/dev/sr1");
        assert_eq!(bus.mounted, vec!["/dev/sr1"]);
    }

    #[test]
    fn test_stage1_uses_policy_and_layout() {
        let init = render_stage1(&ScanPolicy::default(), &["isofs", "squashfs"]);
        assert!(init.starts_with("#!/bin/sh\n"));
        assert!(init.contains("while [ \"$attempt\" -le 10 ]; do"));
        assert!(init.contains("sleep 1"));
        assert!(init.contains("/media/boot/live/rootfs.squashfs"));
        assert!(init.contains("for m in isofs squashfs; do"));
        assert!(init.contains("exec switch_root /newroot /etc/monoboot/stage2.sh"));
        assert!(!init.contains("exec sh"));
    }
}
