//! `Plexus` is a pluggable, multi-channel messaging runtime. Applications
//! submit high-level intents (send bytes, receive bytes, dial a peer, listen
//! for peers, bootstrap a bidirectional conduit) and the runtime drives them
//! to completion across pluggable communication channels whose transport is
//! entirely plugin-owned.

pub mod channel_mgr;
pub mod context;
pub mod encoding;
pub mod engine;
pub mod facade;
pub mod frame;
pub mod handler;
pub mod logging;
pub mod machines;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod support;

/// Length of the package id prefix on every multiplexed payload.
pub const PACKAGE_ID_LEN: usize = 8;

pub use crate::facade::{Acceptor, Conduit, Courier, Receiver, ReplyReceiver, ReplySender};
pub use crate::manager::ApiManager;
pub use crate::plugin::{ChannelPlugin, EventSink, PluginHandle};
pub use crate::support::{
    ApiStatus, ChannelId, ConnId, LinkAddress, LinkId, OpHandle, PackageId, NULL_OP_HANDLE,
};
