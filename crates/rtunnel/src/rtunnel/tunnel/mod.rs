//! Reverse-tunnel control plane: a relay that clients behind NAT log in to, register
//! services with, and serve work connections for. Wire format is frp-compatible.

pub mod auth;
pub mod broker;
pub mod client;
pub mod msg;
pub mod nathole;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod visitor;
