//! Fixed names and paths shared by the builder and the generated boot code.
//!
//! The boot sequencer is generated from these values, so the builder and the
//! image can never disagree about where things live.

/// ISO volume label.
pub const ISO_LABEL: &str = "MONOBOOT";

/// Default artifact file name (under `output/`).
pub const IMAGE_FILENAME: &str = "monoboot.iso";

/// Suffix for the checksum file written next to the artifact.
pub const IMAGE_CHECKSUM_SUFFIX: &str = ".sha256";

/// Suffix for the build manifest (components, memory) next to the artifact.
pub const IMAGE_MANIFEST_SUFFIX: &str = ".manifest.json";

// ─────────────────────────────────────────────────────────────────────────────
// Boot image tree (ISO contents)
// ─────────────────────────────────────────────────────────────────────────────

/// Kernel inside the boot image.
pub const ISO_KERNEL_PATH: &str = "boot/vmlinuz";
/// Initramfs inside the boot image.
pub const ISO_INITRAMFS_PATH: &str = "boot/initramfs.gz";
/// Root image inside the boot image.
pub const ISO_ROOTFS_PATH: &str = "live/rootfs.squashfs";
/// Loader directory inside the boot image.
pub const ISO_LOADER_DIR: &str = "isolinux";

// ─────────────────────────────────────────────────────────────────────────────
// Root filesystem staging
// ─────────────────────────────────────────────────────────────────────────────

/// Kernel payload installed by `linux-virt`.
pub const STAGED_KERNEL: &str = "boot/vmlinuz-virt";
/// Static busybox installed by `busybox-static`.
pub const STAGED_BUSYBOX: &str = "bin/busybox.static";
/// Kernel module tree.
pub const STAGED_MODULES: &str = "lib/modules";

/// Generated Stage 2 sequencer, relative to the root image.
pub const STAGE2_PATH: &str = "etc/monoboot/stage2.sh";

/// Squashfs superblock magic (little-endian "hsqs").
pub const ROOT_IMAGE_MAGIC: &[u8; 4] = b"hsqs";

// ─────────────────────────────────────────────────────────────────────────────
// Stage 1 (initramfs) mount points
// ─────────────────────────────────────────────────────────────────────────────

/// Where a candidate boot device is mounted while probing.
pub const STAGE1_MEDIA_MOUNT: &str = "/media/boot";
/// Where the root image is mounted before switch_root.
pub const STAGE1_NEWROOT: &str = "/newroot";

// ─────────────────────────────────────────────────────────────────────────────
// Service account and terminal service
// ─────────────────────────────────────────────────────────────────────────────

pub const SERVICE_USER: &str = "web";
pub const SERVICE_UID: u32 = 1000;
pub const SERVICE_GID: u32 = 1000;
pub const SERVICE_HOME: &str = "/srv";
pub const SERVICE_SHELL: &str = "/sbin/nologin";

/// Static content served by the terminal service.
pub const WEB_ROOT: &str = "srv/www";
/// Install directory of the optional API process and seed data.
pub const APP_ROOT: &str = "srv/app";
/// Seed dataset loaded by the database fragment when present.
pub const SEED_FILE: &str = "/srv/app/seed.sql";

/// Port the terminal service listens on inside the image.
pub const SERVICE_PORT: u16 = 80;
/// Port the runtime process listens on (localhost only).
pub const RUNTIME_PORT: u16 = 3000;

pub const LIGHTTPD_CONF: &str = "etc/lighttpd/lighttpd.conf";

// ─────────────────────────────────────────────────────────────────────────────
// Emulator contract
// ─────────────────────────────────────────────────────────────────────────────

/// Host port forwarded to `SERVICE_PORT`.
pub const HOST_FORWARD_PORT: u16 = 8080;
pub const MEMORY_MB_DEFAULT: u32 = 256;
pub const MEMORY_MB_DATABASE: u32 = 1024;
