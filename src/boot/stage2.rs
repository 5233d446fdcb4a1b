//! Stage 2: linear execution of the composed script.
//!
//! All conditionality was resolved when the script was composed, so the
//! sequencer is a straight walk over the fragments. Each step's policy is
//! applied here, in one place, and the walk ends by handing the process to
//! the terminal service.

use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::BootError;
use crate::init::{Action, Fragment, FragmentKind, Policy, ServiceUnit, Stage2Script, Step};

use super::stage::BootStage;

/// Executes boot work on behalf of the [`Sequencer`].
pub trait StepRunner {
    /// Run a command to completion. `Err` carries the failure reason.
    fn run(&mut self, command: &str) -> Result<(), String>;
    /// Start a command without waiting for it.
    fn spawn(&mut self, command: &str) -> Result<(), String>;
    fn sleep(&mut self, delay: Duration);
    /// Replace the current process with `command`. Only returns on failure.
    fn replace_process(&mut self, command: &str) -> Result<Infallible, BootError>;
}

pub struct Sequencer<R: StepRunner> {
    runner: R,
    stage: BootStage,
    /// Fail-open failures seen so far, by step name.
    degraded: Vec<String>,
}

impl<R: StepRunner> Sequencer<R> {
    /// A sequencer starts once Stage 1 has switched roots.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            stage: BootStage::Stage2Init,
            degraded: Vec::new(),
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn degraded(&self) -> &[String] {
        &self.degraded
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute the script. On success this never returns.
    pub fn run(&mut self, script: &Stage2Script) -> Result<Infallible, BootError> {
        for fragment in script.fragments() {
            tracing::debug!("fragment {}", fragment.name());
            if fragment.kind == FragmentKind::Terminal {
                return self.hand_off(fragment);
            }
            self.run_fragment(fragment)?;
        }
        Err(BootError::HandoffFailed {
            command: String::new(),
            reason: "script has no terminal fragment".into(),
        })
    }

    fn run_fragment(&mut self, fragment: &Fragment) -> Result<(), BootError> {
        for step in &fragment.steps {
            self.run_step(step)?;
        }
        if let Some(unit) = &fragment.unit {
            self.start_unit(fragment.name(), unit)?;
        }
        for step in &fragment.post {
            self.run_step(step)?;
        }
        Ok(())
    }

    fn run_step(&mut self, step: &Step) -> Result<(), BootError> {
        if let Some(guard) = &step.when {
            if self.runner.run(guard).is_err() {
                return Ok(());
            }
        }
        match self.perform(&step.action) {
            Ok(()) => Ok(()),
            Err(reason) => self.apply_policy(&step.name, step.policy, reason),
        }
    }

    fn perform(&mut self, action: &Action) -> Result<(), String> {
        match action {
            Action::Run { command } => self.runner.run(command),
            Action::Poll {
                probe,
                attempts,
                delay_secs,
            } => {
                for attempt in 1..=*attempts {
                    if self.runner.run(probe).is_ok() {
                        return Ok(());
                    }
                    if attempt < *attempts {
                        self.runner.sleep(Duration::from_secs(u64::from(*delay_secs)));
                    }
                }
                Err(format!("not ready after {} attempts", attempts))
            }
        }
    }

    fn apply_policy(&mut self, name: &str, policy: Policy, reason: String) -> Result<(), BootError> {
        match policy {
            Policy::FailOpen => {
                tracing::warn!("step '{}' failed, continuing: {}", name, reason);
                self.degraded.push(name.to_string());
                Ok(())
            }
            Policy::FailClosed => Err(BootError::StepFailed {
                step: name.to_string(),
                reason,
            }),
        }
    }

    fn start_unit(&mut self, name: &str, unit: &ServiceUnit) -> Result<(), BootError> {
        let started = if unit.backgrounded {
            self.runner.spawn(&unit.start_command)
        } else {
            self.runner.run(&unit.start_command)
        };
        match started {
            Ok(()) => Ok(()),
            // A background unit cannot gate boot.
            Err(reason) if unit.backgrounded || unit.best_effort => {
                self.apply_policy(name, Policy::FailOpen, reason)
            }
            Err(reason) => self.apply_policy(name, Policy::FailClosed, reason),
        }
    }

    fn hand_off(&mut self, terminal: &Fragment) -> Result<Infallible, BootError> {
        for step in &terminal.steps {
            self.run_step(step)?;
        }
        let unit = terminal.unit.as_ref().ok_or_else(|| BootError::HandoffFailed {
            command: String::new(),
            reason: "terminal fragment has no unit".into(),
        })?;
        self.stage = self.stage.advance()?;
        tracing::info!("handing off to {}", unit.start_command);
        self.runner.replace_process(&unit.start_command)
    }
}

/// Runs steps through `sh -c`; the handoff is a real `exec`.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl StepRunner for ShellRunner {
    fn run(&mut self, command: &str) -> Result<(), String> {
        let status = Command::new("sh")
            .args(["-c", command])
            .status()
            .map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("exit status {}", status.code().unwrap_or(-1)))
        }
    }

    fn spawn(&mut self, command: &str) -> Result<(), String> {
        Command::new("sh")
            .args(["-c", command])
            .stdin(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn sleep(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }

    fn replace_process(&mut self, command: &str) -> Result<Infallible, BootError> {
        let err = Command::new("sh")
            .args(["-c", &format!("exec {}", command)])
            .exec();
        Err(BootError::HandoffFailed {
            command: command.to_string(),
            reason: err.to_string(),
        })
    }
}

/// One recorded action of a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Planned {
    Run(String),
    Spawn(String),
    Sleep(Duration),
    Exec(String),
}

/// Records what would happen. Every command succeeds unless listed in
/// `failing`.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    pub plan: Vec<Planned>,
    pub failing: Vec<String>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn outcome(&self, command: &str) -> Result<(), String> {
        if self.failing.iter().any(|f| command.contains(f.as_str())) {
            Err("simulated failure".into())
        } else {
            Ok(())
        }
    }

    /// Human-readable plan, one action per line.
    pub fn render(&self) -> String {
        self.plan
            .iter()
            .map(|p| match p {
                Planned::Run(c) => format!("run    {}", c),
                Planned::Spawn(c) => format!("spawn  {}", c),
                Planned::Sleep(d) => format!("sleep  {}s", d.as_secs()),
                Planned::Exec(c) => format!("exec   {}", c),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl StepRunner for DryRunRunner {
    fn run(&mut self, command: &str) -> Result<(), String> {
        self.plan.push(Planned::Run(command.to_string()));
        self.outcome(command)
    }

    fn spawn(&mut self, command: &str) -> Result<(), String> {
        self.plan.push(Planned::Spawn(command.to_string()));
        self.outcome(command)
    }

    fn sleep(&mut self, delay: Duration) {
        self.plan.push(Planned::Sleep(delay));
    }

    fn replace_process(&mut self, command: &str) -> Result<Infallible, BootError> {
        self.plan.push(Planned::Exec(command.to_string()));
        Err(BootError::HandoffFailed {
            command: command.to_string(),
            reason: "dry run does not replace the process".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{BuildConfig, Feature};
    use std::path::Path;

    fn script(features: &[Feature]) -> Stage2Script {
        let cfg = BuildConfig::from_features(features.iter().copied()).unwrap();
        Stage2Script::compose(&cfg.manifest()).unwrap()
    }

    fn dry_run(script: &Stage2Script, failing: &[&str]) -> (Sequencer<DryRunRunner>, BootError) {
        let mut runner = DryRunRunner::new();
        runner.failing = failing.iter().map(|s| s.to_string()).collect();
        let mut seq = Sequencer::new(runner);
        let err = match seq.run(script) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        (seq, err)
    }

    #[test]
    fn test_handoff_is_last_action() {
        let (seq, err) = dry_run(&script(&[]), &[]);
        assert!(matches!(err, BootError::HandoffFailed { .. }));
        assert_eq!(seq.stage(), BootStage::ServiceHandoff);
        let last = seq.runner().plan.last().unwrap();
        assert!(matches!(last, Planned::Exec(c) if c.starts_with("lighttpd -D")));
        let execs = seq
            .runner()
            .plan
            .iter()
            .filter(|p| matches!(p, Planned::Exec(_)))
            .count();
        assert_eq!(execs, 1);
    }

    #[test]
    fn test_fail_open_steps_continue() {
        let (seq, err) = dry_run(&script(&[]), &["udhcpc", "sysctl -q -w kernel.kptr_restrict"]);
        assert!(matches!(err, BootError::HandoffFailed { .. }));
        assert_eq!(seq.degraded(), ["dhcp", "sysctl-kernel.kptr_restrict"]);
    }

    #[test]
    fn test_fail_closed_step_halts_before_handoff() {
        let (seq, err) = dry_run(&script(&[]), &["remount,ro"]);
        assert_eq!(
            err,
            BootError::StepFailed {
                step: "remount-root-ro".into(),
                reason: "simulated failure".into()
            }
        );
        assert_eq!(seq.stage(), BootStage::Stage2Init);
        assert!(!seq
            .runner()
            .plan
            .iter()
            .any(|p| matches!(p, Planned::Exec(_))));
    }

    #[test]
    fn test_background_units_are_spawned() {
        let (seq, _) = dry_run(&script(&[Feature::Discovery, Feature::Runtime]), &[]);
        let spawned: Vec<_> = seq
            .runner()
            .plan
            .iter()
            .filter_map(|p| match p {
                Planned::Spawn(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(spawned.len(), 2);
        assert!(spawned[0].starts_with("avahi-daemon"));
    }

    #[test]
    fn test_database_poll_is_bounded_and_fail_open() {
        let (seq, err) = dry_run(
            &script(&[Feature::Runtime, Feature::Database]),
            &["pg_isready"],
        );
        assert!(matches!(err, BootError::HandoffFailed { .. }));
        let sleeps = seq
            .runner()
            .plan
            .iter()
            .filter(|p| matches!(p, Planned::Sleep(_)))
            .count();
        assert_eq!(sleeps, 29);
        assert!(seq.degraded().contains(&"pg-ready".to_string()));
    }

    #[test]
    fn test_absent_seed_is_skipped_silently() {
        let (seq, _) = dry_run(
            &script(&[Feature::Runtime, Feature::Database]),
            &["[ -f /srv/app/seed.sql ]"],
        );
        assert!(!seq
            .runner()
            .plan
            .iter()
            .any(|p| matches!(p, Planned::Run(c) if c.starts_with("psql"))));
        assert!(!seq.degraded().contains(&"pg-seed".to_string()));
    }

    fn shell_script(dir: &Path) -> Stage2Script {
        let base = Fragment {
            kind: FragmentKind::Base,
            steps: vec![
                Step::open("marker", format!("touch {}/ran", dir.display())),
                Step::open("skipped", format!("touch {}/skipped", dir.display())).when("false"),
                Step::open("flaky", "exit 7"),
                Step::closed("gate", "exit 3"),
            ],
            unit: None,
            post: vec![],
        };
        let terminal = Fragment {
            kind: FragmentKind::Terminal,
            steps: vec![],
            unit: Some(ServiceUnit::terminal("true")),
            post: vec![],
        };
        Stage2Script::from_fragments(vec![base, terminal]).unwrap()
    }

    #[test]
    fn test_shell_runner_applies_policies_with_real_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = Sequencer::new(ShellRunner);
        let err = match seq.run(&shell_script(dir.path())) {
            Ok(never) => match never {},
            Err(e) => e,
        };

        assert_eq!(
            err,
            BootError::StepFailed {
                step: "gate".into(),
                reason: "exit status 3".into(),
            }
        );
        assert_eq!(seq.degraded(), ["flaky"]);
        // A closed failure stops the walk before any handoff.
        assert_eq!(seq.stage(), BootStage::Stage2Init);
        assert!(dir.path().join("ran").exists());
        assert!(!dir.path().join("skipped").exists());
    }

    #[test]
    fn test_shell_runner_spawn_does_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("done");
        let mut runner = ShellRunner;
        runner
            .spawn(&format!("sleep 0.2; touch {}", done.display()))
            .unwrap();
        assert!(!done.exists());

        for _ in 0..50 {
            if done.exists() {
                break;
            }
            runner.sleep(Duration::from_millis(100));
        }
        assert!(done.exists());
    }
}
