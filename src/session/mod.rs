pub mod activation;
pub mod coordinator;
pub mod cursor;
pub mod hub;
pub mod store;
pub mod supervisor;

pub use activation::ActivationSet;
pub use coordinator::{AttachOutcome, CoordinatorHandle, Phase, SendOutcome, SessionContext};
pub use cursor::{Advance, CursorStore};
pub use hub::SessionHub;
pub use store::{ChatStore, InputState, SessionView, StoreEvent, StreamingBuffer, ACTIVATING_PLACEHOLDER};
pub use supervisor::{Backoff, ReconnectSupervisor, SupervisorEvent};
