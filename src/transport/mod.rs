pub mod client;
pub mod connection;
pub mod websocket;

pub use client::{ReconnectPolicy, Transport, TransportEvent, TransportState, TransportStats};
pub use connection::{ConnectionHandle, Connector, LinkEvent, Outgoing, WireMessage};
pub use websocket::WebSocketConnector;
