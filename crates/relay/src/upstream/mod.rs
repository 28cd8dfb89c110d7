// Upstream chat server connections.

pub mod client;
pub mod resolver;
