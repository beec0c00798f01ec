//! The `transport` module carries the broker over WebSockets.
//!
//! - `message`: the JSON request/reply protocol
//! - `websocket`: the server side, serving a `SharedBroker` to remote clients
//! - `remote`: the client side, implementing the broker client seam so chat
//!   sessions can run against a broker in another process

pub mod message;
pub mod remote;
pub mod websocket;

pub use remote::RemoteConnector;
pub use websocket::start_websocket_server;
