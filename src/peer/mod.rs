pub mod connection;
pub mod ice;
pub mod manager;
pub mod reconnect;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcTransport;
pub use manager::{ConnectionManager, ReplaceOutcome, SignalOutcome};
pub use transport::{PeerTransport, TransportEvent, TransportStats, VideoSource};
pub use types::{ConnectionState, IceCandidate, IceServer, IceServerConfig};
