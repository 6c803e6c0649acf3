pub mod error;
pub mod flows;
pub mod validation;

pub use error::StoreError;
pub use flows::{FlowStore, SaveAck};
pub use validation::{AcceptAll, FlowValidator, ValidationIssue, ValidationReport};
