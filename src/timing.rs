//! Build timing utilities.

use std::time::Instant;

/// Measures one build phase and logs its duration when finished.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        tracing::info!("[{}] {}", format_elapsed(self.start.elapsed().as_secs_f64()), self.name);
    }
}

/// Format seconds as "12.3s" or "2.1m".
pub fn format_elapsed(secs: f64) -> String {
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
