//! Supervisor-side state and event loop.

pub mod children;
pub mod handler;
pub mod runner;
pub mod signals;

pub use children::{ChildRecord, ChildTable};
pub use runner::{SetupError, Supervisor};
