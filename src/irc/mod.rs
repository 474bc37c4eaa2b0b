//! IRC wire handling: framing, messages, connections and inbound dispatch.

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod message;
