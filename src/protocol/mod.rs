//! Control protocol shared by both peers

pub mod action;
pub mod format;

pub use action::{Action, ActionType, Command};
pub use format::{FormatDescriptor, SampleKind};
