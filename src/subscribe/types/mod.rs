pub mod request;
pub mod response;
pub mod status;

pub use request::Subscription;
pub use response::{Cursor, MessageKind, PnMessage, PnPresence, PresenceEvent, StreamEvent};
pub use status::{OperationType, PnStatus, StatusCategory};
