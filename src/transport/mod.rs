//! Network transport: TCP channels with TLS upgrade.

pub mod channel;
pub mod tls_config;

pub use channel::{ChannelHandle, DeviceChannel, SecuredChannel};
