pub mod config;
pub mod events;
pub mod session;

pub use config::Config;
pub use events::{ActiveAgentsEvent, Cursor, DonePayload, StreamEvent};
pub use session::{
    ActiveAgent, ActiveAgents, Message, MessageId, ResponseStatus, Role, Session,
    SessionTrigger, SessionWithMessages, Step,
};
