//! Change Governance
//!
//! Wraps configuration mutations either as immediate writes or as change requests
//! that go through draft, open, approved and applied before anything is written.

pub mod gateway;
pub mod handlers;
pub mod policy;
pub mod records;
pub mod state_machine;
pub mod types;

pub use gateway::ChangeGateway;
pub use handlers::{ChangeHandler, HandlerRegistry};
pub use policy::PolicyStore;
pub use records::JsonRecordHandler;
pub use state_machine::{ChangeRequestService, NewChangeItem};
pub use types::*;
