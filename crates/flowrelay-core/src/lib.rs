pub mod document;
pub mod ids;
pub mod protocol;

pub use document::{FlowDocument, Record};
pub use ids::{ClientId, FlowId};
pub use protocol::{DecodeError, InboundMessage, MessageKind};
