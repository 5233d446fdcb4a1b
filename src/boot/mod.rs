//! Runtime model of the image's boot sequence.
//!
//! ```text
//! Stage1Discovery ──► Stage2Init ──► ServiceHandoff (terminal, exec)
//! ```
//!
//! Stage 1 ships as the initramfs `/init` rendered by
//! [`discovery::render_stage1`]; Stage 2 ships as the composed
//! [`Stage2Script`](crate::init::Stage2Script). The types here model both so
//! their behaviour can be exercised without booting anything.

pub mod discovery;
pub mod signature;
pub mod stage;
pub mod stage2;

pub use discovery::{render_stage1, DeviceProbe, Discovery, DiscoveryState, ScanPolicy};
pub use signature::is_root_image;
pub use stage::BootStage;
pub use stage2::{DryRunRunner, Sequencer, ShellRunner, StepRunner};
