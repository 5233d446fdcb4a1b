//! Fragment building blocks: steps, service units and their rendering.

use std::fmt::Write as _;

use serde::Serialize;

use crate::features::Feature;

/// What happens when a step fails at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Log and park forever. Used where continuing would weaken the image's
    /// security posture.
    FailClosed,
    /// Log and continue. Used where failure only degrades functionality.
    FailOpen,
}

impl Policy {
    /// Shell helper invoked on failure.
    pub fn handler(self) -> &'static str {
        match self {
            Policy::FailClosed => "halt_boot",
            Policy::FailOpen => "fail_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Action {
    /// Run a command once.
    Run { command: String },
    /// Retry a probe until it succeeds or the budget runs out.
    Poll {
        probe: String,
        attempts: u32,
        delay_secs: u32,
    },
}

/// One unit of boot work with its own failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub name: String,
    pub action: Action,
    pub policy: Policy,
    /// Guard; when it evaluates false the step is skipped silently.
    pub when: Option<String>,
}

impl Step {
    pub fn closed(name: &str, command: impl Into<String>) -> Self {
        Self::new(name, command, Policy::FailClosed)
    }

    pub fn open(name: &str, command: impl Into<String>) -> Self {
        Self::new(name, command, Policy::FailOpen)
    }

    fn new(name: &str, command: impl Into<String>, policy: Policy) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Run {
                command: command.into(),
            },
            policy,
            when: None,
        }
    }

    pub fn poll(name: &str, probe: impl Into<String>, attempts: u32, delay_secs: u32) -> Self {
        Self {
            name: name.to_string(),
            action: Action::Poll {
                probe: probe.into(),
                attempts,
                delay_secs,
            },
            policy: Policy::FailOpen,
            when: None,
        }
    }

    pub fn when(mut self, guard: impl Into<String>) -> Self {
        self.when = Some(guard.into());
        self
    }

    fn render_body(&self, out: &mut String, indent: &str) {
        let handler = self.policy.handler();
        match &self.action {
            Action::Run { command } => {
                let _ = writeln!(out, "{indent}{} || {handler} \"{}\"", group(command), self.name);
            }
            Action::Poll {
                probe,
                attempts,
                delay_secs,
            } => {
                let _ = writeln!(out, "{indent}n=0");
                let _ = writeln!(out, "{indent}until {}; do", group(probe));
                let _ = writeln!(out, "{indent}    n=$((n + 1))");
                let _ = writeln!(out, "{indent}    if [ \"$n\" -ge {attempts} ]; then");
                let _ = writeln!(out, "{indent}        {handler} \"{}\"", self.name);
                let _ = writeln!(out, "{indent}        break");
                let _ = writeln!(out, "{indent}    fi");
                let _ = writeln!(out, "{indent}    sleep {delay_secs}");
                let _ = writeln!(out, "{indent}done");
            }
        }
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# step: {} ({})", self.name, policy_label(self.policy));
        match &self.when {
            Some(guard) => {
                let _ = writeln!(out, "if {guard}; then");
                self.render_body(out, "    ");
                let _ = writeln!(out, "fi");
            }
            None => self.render_body(out, ""),
        }
    }
}

fn policy_label(policy: Policy) -> &'static str {
    match policy {
        Policy::FailClosed => "fail-closed",
        Policy::FailOpen => "fail-open",
    }
}

/// Commands with sequencing need grouping so `||` applies to the whole thing.
fn group(command: &str) -> String {
    if command.contains(';') {
        format!("{{ {command}; }}")
    } else {
        command.to_string()
    }
}

/// How a component's long-running process is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceUnit {
    pub order: u16,
    pub start_command: String,
    pub backgrounded: bool,
    pub best_effort: bool,
}

impl ServiceUnit {
    pub fn background(order: u16, start_command: impl Into<String>) -> Self {
        Self {
            order,
            start_command: start_command.into(),
            backgrounded: true,
            best_effort: true,
        }
    }

    pub fn foreground(order: u16, start_command: impl Into<String>, best_effort: bool) -> Self {
        Self {
            order,
            start_command: start_command.into(),
            backgrounded: false,
            best_effort,
        }
    }

    /// The single unit that takes over the sequencer's process identity.
    pub fn terminal(start_command: impl Into<String>) -> Self {
        Self {
            order: u16::MAX,
            start_command: start_command.into(),
            backgrounded: false,
            best_effort: false,
        }
    }

    fn render(&self, name: &str, kind: FragmentKind, out: &mut String) {
        let _ = writeln!(out, "# unit: {} (order {})", name, self.order);
        if kind == FragmentKind::Terminal {
            let _ = writeln!(out, "log \"handing off to {}\"", name);
            let _ = writeln!(out, "exec {}", self.start_command);
            return;
        }
        let handler = if self.best_effort {
            Policy::FailOpen.handler()
        } else {
            Policy::FailClosed.handler()
        };
        if self.backgrounded {
            // A background failure cannot gate boot; it is only reported.
            let _ = writeln!(
                out,
                "( {} || {} \"{}\" ) &",
                self.start_command,
                Policy::FailOpen.handler(),
                name
            );
        } else {
            let _ = writeln!(out, "{} || {handler} \"{}\"", group(&self.start_command), name);
        }
    }
}

/// Where a fragment sits in the Stage 2 script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Base,
    Optional(Feature),
    Terminal,
}

/// Self-contained piece of boot logic for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub kind: FragmentKind,
    /// Steps before the unit starts.
    pub steps: Vec<Step>,
    pub unit: Option<ServiceUnit>,
    /// Steps after the unit started (readiness, seeding).
    pub post: Vec<Step>,
}

impl Fragment {
    pub fn name(&self) -> &'static str {
        match self.kind {
            FragmentKind::Base => "base",
            FragmentKind::Optional(feature) => feature.key(),
            FragmentKind::Terminal => "terminal",
        }
    }

    /// Marker line delimiting this fragment in the rendered script.
    pub fn marker(&self) -> String {
        format!("# --- fragment: {} ---", self.name())
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "{}", self.marker());
        for step in &self.steps {
            step.render(out);
        }
        if let Some(unit) = &self.unit {
            unit.render(self.name(), self.kind, out);
        }
        for step in &self.post {
            step.render(out);
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(step: &Step) -> String {
        let mut s = String::new();
        step.render(&mut s);
        s
    }

    #[test]
    fn test_policy_selects_handler() {
        assert!(rendered(&Step::closed("ro", "mount -o remount,ro /"))
            .contains("mount -o remount,ro / || halt_boot \"ro\""));
        assert!(rendered(&Step::open("lo", "ip link set lo up"))
            .contains("ip link set lo up || fail_open \"lo\""));
    }

    #[test]
    fn test_sequenced_command_is_grouped() {
        let out = rendered(&Step::open("x", "a; b"));
        assert!(out.contains("{ a; b; } || fail_open \"x\""));
    }

    #[test]
    fn test_guarded_step_wraps_in_if() {
        let out = rendered(&Step::open("seed", "psql -f s.sql").when("[ -f s.sql ]"));
        assert!(out.contains("if [ -f s.sql ]; then\n    psql -f s.sql || fail_open \"seed\"\nfi"));
    }

    #[test]
    fn test_poll_is_bounded() {
        let out = rendered(&Step::poll("ready", "pg_isready -q", 30, 1));
        assert!(out.contains("until pg_isready -q; do"));
        assert!(out.contains("-ge 30"));
        assert!(out.contains("sleep 1"));
        assert!(out.contains("break"));
    }

    #[test]
    fn test_terminal_unit_renders_exec() {
        let frag = Fragment {
            kind: FragmentKind::Terminal,
            steps: vec![],
            unit: Some(ServiceUnit::terminal("lighttpd -D")),
            post: vec![],
        };
        let mut out = String::new();
        frag.render(&mut out);
        assert!(out.contains("exec lighttpd -D\n"));
        assert!(!out.contains('&'));
    }

    #[test]
    fn test_background_unit() {
        let frag = Fragment {
            kind: FragmentKind::Optional(Feature::Discovery),
            steps: vec![],
            unit: Some(ServiceUnit::background(10, "avahi-daemon")),
            post: vec![],
        };
        let mut out = String::new();
        frag.render(&mut out);
        assert!(out.contains("( avahi-daemon || fail_open \"discovery\" ) &"));
    }
}
