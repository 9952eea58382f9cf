use crate::channel_mgr::ChannelRole;
use crate::support::{
    ChannelId, ChannelProps, ChannelStatus, ConnId, ConnectionStatus, LinkAddress, LinkId,
    LinkKind, LinkProps, LinkStatus, OpHandle, PackageStatus, SdkResponse,
};
use std::sync::Arc;

/// Operations the runtime invokes on a communication channel plugin.
///
/// Every method is asynchronous: the synchronous `SdkResponse` only reports
/// whether the request was accepted. The outcome arrives later through the
/// [`EventSink`] the plugin was constructed with, echoing the `handle` that
/// was passed in verbatim.
///
/// Delivery pauses caused by transient transport failures are the plugin's
/// concern: a plugin that cannot currently send on a connection must hold
/// that connection's queue until it reports the next
/// `ConnectionStatus::Open` or `ConnectionStatus::Closed`. The runtime never
/// retries.
pub trait ChannelPlugin: Send + Sync {
    fn activate_channel(&self, handle: OpHandle, channel_id: &ChannelId, role: &str)
        -> SdkResponse;

    fn create_link(&self, handle: OpHandle, channel_id: &ChannelId) -> SdkResponse;

    fn load_link_address(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        address: &LinkAddress,
    ) -> SdkResponse;

    fn load_link_addresses(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        addresses: &[LinkAddress],
    ) -> SdkResponse;

    fn create_link_from_address(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        address: &LinkAddress,
    ) -> SdkResponse;

    fn create_bootstrap_link(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        passphrase: &str,
    ) -> SdkResponse;

    fn open_connection(
        &self,
        handle: OpHandle,
        kind: LinkKind,
        link_id: &LinkId,
        hints: &str,
        send_timeout: u64,
    ) -> SdkResponse;

    fn send_package(
        &self,
        handle: OpHandle,
        conn_id: &ConnId,
        package: Vec<u8>,
        deadline: f64,
        batch_id: u64,
    ) -> SdkResponse;

    fn close_connection(&self, handle: OpHandle, conn_id: &ConnId) -> SdkResponse;

    fn destroy_link(&self, handle: OpHandle, link_id: &LinkId) -> SdkResponse;

    fn deactivate_channel(&self, handle: OpHandle, channel_id: &ChannelId) -> SdkResponse;
}

/// Callback surface a plugin delivers its results through. Implemented by
/// the manager; every call is posted onto the manager worker and returns
/// immediately.
pub trait EventSink: Send + Sync {
    fn on_channel_status_changed(
        &self,
        handle: OpHandle,
        channel_id: &ChannelId,
        status: ChannelStatus,
        props: ChannelProps,
    ) -> SdkResponse;

    fn on_link_status_changed(
        &self,
        handle: OpHandle,
        link_id: &LinkId,
        status: LinkStatus,
        props: LinkProps,
    ) -> SdkResponse;

    fn on_connection_status_changed(
        &self,
        handle: OpHandle,
        conn_id: &ConnId,
        status: ConnectionStatus,
        props: LinkProps,
    ) -> SdkResponse;

    fn on_package_status_changed(&self, handle: OpHandle, status: PackageStatus) -> SdkResponse;

    /// Inbound package delivery. Exactly one connection id per call.
    fn receive_enc_pkg(&self, package: Vec<u8>, conn_ids: &[ConnId]) -> SdkResponse;
}

/// A registered channel: the plugin that serves it plus the roles the
/// channel supports.
#[derive(Clone)]
pub struct PluginHandle {
    pub channel_id: ChannelId,
    pub roles: Vec<ChannelRole>,
    pub plugin: Arc<dyn ChannelPlugin>,
}

impl PluginHandle {
    #[inline]
    pub fn new(
        channel_id: &str,
        roles: Vec<ChannelRole>,
        plugin: Arc<dyn ChannelPlugin>,
    ) -> PluginHandle {
        PluginHandle {
            channel_id: channel_id.into(),
            roles,
            plugin,
        }
    }
}
