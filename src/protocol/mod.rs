//! Protocol layer between the host and a plugin process
//!
//! A plugin announces itself with a handshake frame carrying the magic
//! cookie and the protocol generation it speaks. Generation 1 serves one
//! legacy object; generation 2 dispenses independent capability objects.
//! Both end up behind a [`ProtocolClient`].

pub mod client;
pub mod frame;
pub mod handshake;
pub mod remote;
pub mod rpc;
pub mod v1;
pub mod v2;
pub mod version;

pub use client::{Capability, CapabilityObject, CapabilitySet, LegacyPlugin, ProtocolClient};
pub use frame::Frame;
pub use handshake::{Handshake, HandshakeConfig};
pub use remote::RemoteCapability;
pub use rpc::RpcChannel;
pub use v1::ClientV1;
pub use v2::ClientV2;
pub use version::ProtocolVersion;
