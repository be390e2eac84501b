pub mod advisory;
pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod governance;
pub mod locks;

pub use error::GovernanceError;
