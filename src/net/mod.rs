//! Connections, channels and the transports they run on

pub mod channel;
pub mod connection;
pub mod tcp;
pub mod transport;
