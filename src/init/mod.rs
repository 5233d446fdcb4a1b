//! Stage 2 init script generation.
//!
//! The sequencer is assembled from [`Fragment`]s, never written by hand:
//!
//! ```text
//! base ─► [discovery] ─► [runtime] ─► [database] ─► terminal (exec)
//! ```

pub mod catalog;
pub mod fragment;
pub mod script;

pub use fragment::{Action, Fragment, FragmentKind, Policy, ServiceUnit, Step};
pub use script::{write_stage2, Stage2Script};
