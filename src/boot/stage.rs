//! Boot progress of the image.

use serde::Serialize;

use crate::error::BootError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootStage {
    /// Initramfs: find and mount the root image.
    Stage1Discovery,
    /// Generated sequencer running from the root image.
    Stage2Init,
    /// The terminal service owns the process. No way back.
    ServiceHandoff,
}

impl BootStage {
    pub const INITIAL: BootStage = BootStage::Stage1Discovery;

    pub fn name(self) -> &'static str {
        match self {
            BootStage::Stage1Discovery => "stage1-discovery",
            BootStage::Stage2Init => "stage2-init",
            BootStage::ServiceHandoff => "service-handoff",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == BootStage::ServiceHandoff
    }

    pub fn advance(self) -> Result<BootStage, BootError> {
        match self {
            BootStage::Stage1Discovery => Ok(BootStage::Stage2Init),
            BootStage::Stage2Init => Ok(BootStage::ServiceHandoff),
            BootStage::ServiceHandoff => Err(BootError::PastHandoff(self.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_progress() {
        let s = BootStage::INITIAL;
        let s = s.advance().unwrap();
        assert_eq!(s, BootStage::Stage2Init);
        let s = s.advance().unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_handoff() {
        assert_eq!(
            BootStage::ServiceHandoff.advance(),
            Err(BootError::PastHandoff("service-handoff"))
        );
    }
}
