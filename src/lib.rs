//! monoboot library exports.
//!
//! The binary is a thin CLI over these modules; integration tests in
//! `tests/` use them directly.

pub mod acquire;
pub mod artifact;
pub mod boot;
pub mod clean;
pub mod config;
pub mod error;
pub mod features;
pub mod harden;
pub mod init;
pub mod initramfs;
pub mod layout;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod staging;
pub mod timing;
pub mod workspace;
