//! Cooperative cancellation on SIGINT/SIGTERM.
//!
//! The handler only sets a flag. The pipeline polls it between stages and
//! the installer between steps, so every cleanup guard (sandbox mounts,
//! partial artifacts, build lock) still runs on the way out. Repeated
//! signals only set the flag again; the process never exits from inside the
//! handler while a sandbox may be mounted.

use anyhow::{bail, Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM to this flag.
    pub fn register(&self) -> Result<()> {
        for signal in [SIGINT, SIGTERM] {
            flag::register(signal, Arc::clone(&self.flag))
                .context("Failed to install signal handler")?;
        }
        Ok(())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            bail!("Build interrupted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let seen_by_worker = interrupt.clone();
        assert!(interrupt.check().is_ok());
        interrupt.trigger();
        assert!(seen_by_worker.is_set());
        assert!(seen_by_worker.check().unwrap_err().to_string().contains("interrupted"));
    }

    #[test]
    fn test_repeated_sigterm_only_sets_flag() {
        let interrupt = Interrupt::new();
        interrupt.register().unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        // Still running, with the flag set.
        assert!(interrupt.is_set());
    }
}
