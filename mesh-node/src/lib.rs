//! MeshMind node runtime: catalog, discovery, bearer transports, session drivers and the
//! coordinator that ties them together.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod generation;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;

pub use catalog::{Catalog, SweepReport};
pub use config::Config;
pub use coordinator::Coordinator;
pub use discovery::{
    Discovery, DiscoveryBackend, DiscoveryConfig, PeerEvent, PeerTable, RemovalReason,
    ScriptedDiscovery, UdpMulticast,
};
pub use generation::{GenerationClient, GenerationRequest, GenerationResponse};
pub use session::{SessionConfig, SessionHandle};
pub use store::{CatalogStore, Preferences};
pub use transport::{
    AddressBook, Connector, FrameChannel, Listener, MemoryConnector, MemoryListener,
    MemoryNetwork, TcpBearer, TcpConnector,
};
