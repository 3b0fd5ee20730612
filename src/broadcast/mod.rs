pub mod heartbeat;
pub mod protocol;
pub mod registry;

pub use protocol::{ClientMessage, Heartbeat, ServerEvent, ServerMessage};
pub use registry::{Session, SessionId, SessionRegistry, SweepReport};
