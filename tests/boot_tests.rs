//! Boot sequence model: Stage 1 device scan and Stage 2 dry runs.

use monoboot::boot::{BootStage, DeviceProbe, Discovery, DiscoveryState, DryRunRunner, ScanPolicy, Sequencer};
use monoboot::error::BootError;
use monoboot::features::{BuildConfig, Feature};
use monoboot::init::Stage2Script;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

/// Device bus whose contents change per scan attempt.
struct ScriptedBus {
    waves: Vec<Vec<String>>,
    signed: BTreeSet<String>,
    scans: usize,
    mounted: Vec<String>,
}

impl DeviceProbe for ScriptedBus {
    fn enumerate(&mut self) -> Vec<String> {
        let wave = self.waves.get(self.scans).cloned().unwrap_or_default();
        self.scans += 1;
        wave
    }
    fn carries_signature(&mut self, device: &str) -> bool {
        self.signed.contains(device)
    }
    fn mount_root(&mut self, device: &str) -> Result<(), String> {
        self.mounted.push(device.to_string());
        Ok(())
    }
    fn wait(&mut self, _delay: Duration) {}
}

fn device() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u8..3).prop_map(|n| format!("/dev/sr{}", n)),
        (b'a'..b'e').prop_map(|c| format!("/dev/vd{}", c as char)),
        (b'a'..b'e').prop_map(|c| format!("/dev/sd{}", c as char)),
    ]
}

proptest! {
    #[test]
    fn prop_scan_mounts_first_signed_device(
        waves in prop::collection::vec(prop::collection::vec(device(), 0..5), 0..6),
        signed in prop::collection::btree_set(device(), 0..4),
        attempts in 1u32..6,
    ) {
        let expected = waves
            .iter()
            .take(attempts as usize)
            .flat_map(|w| w.iter())
            .find(|d| signed.contains(*d))
            .cloned();

        let mut bus = ScriptedBus { waves, signed, scans: 0, mounted: Vec::new() };
        let mut discovery = Discovery::new(ScanPolicy { attempts, delay: Duration::ZERO });
        let result = discovery.run(&mut bus);

        prop_assert!(bus.mounted.len() <= 1);
        match expected {
            Some(dev) => {
                prop_assert_eq!(result, Ok(dev.clone()));
                prop_assert_eq!(discovery.state(), &DiscoveryState::Mounted(dev));
            }
            None => {
                prop_assert_eq!(result, Err(BootError::DiscoveryExhausted { attempts }));
                prop_assert_eq!(discovery.state(), &DiscoveryState::Failed);
                prop_assert_eq!(bus.scans, attempts as usize);
            }
        }
    }
}

fn dry_run(features: &[Feature], failing: &[&str]) -> (Sequencer<DryRunRunner>, BootError) {
    let build = BuildConfig::from_features(features.iter().copied()).unwrap();
    let script = Stage2Script::compose(&build.manifest()).unwrap();
    let mut runner = DryRunRunner::new();
    runner.failing = failing.iter().map(|s| s.to_string()).collect();
    let mut seq = Sequencer::new(runner);
    let err = match seq.run(&script) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    (seq, err)
}

#[test]
fn test_network_failure_still_reaches_handoff() {
    let (seq, err) = dry_run(&[Feature::Discovery], &["udhcpc", "avahi-daemon"]);
    assert!(matches!(err, BootError::HandoffFailed { .. }));
    assert_eq!(seq.stage(), BootStage::ServiceHandoff);
    assert!(seq.degraded().iter().any(|s| s == "dhcp"));
    assert!(seq.degraded().iter().any(|s| s == "discovery"));
}

#[test]
fn test_read_only_remount_failure_halts_before_handoff() {
    let (seq, err) = dry_run(&[], &["remount,ro"]);
    assert_eq!(
        err,
        BootError::StepFailed {
            step: "remount-root-ro".into(),
            reason: "simulated failure".into()
        }
    );
    assert_eq!(seq.stage(), BootStage::Stage2Init);
    assert!(!seq.runner().render().contains("exec "));
}

#[test]
fn test_database_not_ready_is_degraded_not_fatal() {
    let (seq, err) = dry_run(&[Feature::Runtime, Feature::Database], &["pg_isready"]);
    assert!(matches!(err, BootError::HandoffFailed { .. }));
    assert!(seq.degraded().iter().any(|s| s == "pg-ready"));
    assert!(seq.runner().render().lines().last().unwrap().starts_with("exec   lighttpd"));
}
