pub mod envelope;
pub mod member;
pub mod message;
pub mod peer_messages;
