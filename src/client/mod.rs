pub mod auth;
pub mod backend;
pub mod error;
pub mod http;
pub mod sse;
pub mod transport;

pub use auth::{AuthErrorState, AuthMonitor, ConnectivityProbe, StaticConnectivity, TcpConnectivity};
pub use backend::{ActiveAgentsFeed, AgentBackend};
pub use error::ClientError;
pub use http::AgentClient;
pub use transport::{Sequence, SessionStream, Transport, TransportSender};
