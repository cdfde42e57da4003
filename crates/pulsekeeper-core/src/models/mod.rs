//! Data models for Pulsekeeper

mod alert;
mod extension;
mod plan;
mod project;
mod report;
mod user;

pub use alert::*;
pub use extension::*;
pub use plan::*;
pub use project::*;
pub use report::*;
pub use user::*;
