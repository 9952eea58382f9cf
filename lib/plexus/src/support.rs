use crate::PACKAGE_ID_LEN;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Correlates an asynchronous request with its later status callback.
/// Non-zero and effectively unique within a run.
pub type OpHandle = u64;

pub const NULL_OP_HANDLE: OpHandle = 0;

pub type ChannelId = String;
pub type LinkId = String;
pub type ConnId = String;
pub type LinkAddress = String;

/// Monotonic handle generator. Starts at 1 and wraps back to 1 past
/// `i64::MAX` so a handle is never zero.
#[derive(Clone)]
pub struct HandleSource {
    next: Arc<AtomicU64>,
}

impl HandleSource {
    #[inline]
    pub fn new() -> HandleSource {
        HandleSource {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    #[inline]
    pub fn next(&self) -> OpHandle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);

        if handle > i64::max_value() as u64 {
            self.next.store(2, Ordering::Relaxed);
            return 1;
        }

        handle
    }
}

/// Short random tag prepended to every multiplexed payload so multiple
/// logical conduits can share one connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PackageId([u8; PACKAGE_ID_LEN]);

impl PackageId {
    #[inline]
    pub fn new(bytes: [u8; PACKAGE_ID_LEN]) -> PackageId {
        PackageId(bytes)
    }

    /// Zero tag used to frame hello messages whose real package id travels
    /// inside the envelope.
    #[inline]
    pub fn zero() -> PackageId {
        PackageId([0; PACKAGE_ID_LEN])
    }

    #[inline]
    pub fn random<R: rand::Rng>(rng: &mut R) -> PackageId {
        let mut bytes = [0u8; PACKAGE_ID_LEN];
        rng.fill(&mut bytes[..]);
        PackageId(bytes)
    }

    /// Reads the tag off the front of a payload, if the payload is long
    /// enough to carry one.
    #[inline]
    pub fn from_prefix(payload: &[u8]) -> Option<PackageId> {
        if payload.len() < PACKAGE_ID_LEN {
            return None;
        }

        let mut bytes = [0u8; PACKAGE_ID_LEN];
        bytes.copy_from_slice(&payload[..PACKAGE_ID_LEN]);
        Some(PackageId(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PACKAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Terminal status delivered to every user-facing callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ApiStatus {
    Invalid,
    Ok,
    Closing,
    ChannelInvalid,
    InvalidArgument,
    PluginError,
    InternalError,
    Timeout,
}

/// Synchronous accept/reject response for posted work and plugin requests.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdkStatus {
    Ok,
    Invalid,
    InvalidArgument,
    PluginMissing,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SdkResponse {
    pub status: SdkStatus,
}

impl SdkResponse {
    #[inline]
    pub fn ok() -> SdkResponse {
        SdkResponse {
            status: SdkStatus::Ok,
        }
    }

    #[inline]
    pub fn new(status: SdkStatus) -> SdkResponse {
        SdkResponse { status }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == SdkStatus::Ok
    }
}

// ----------------------------------------------
// Plugin-reported statuses
// ----------------------------------------------

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelStatus {
    Undefined,
    Enabled,
    Starting,
    Available,
    Failed,
    Unavailable,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkStatus {
    Undefined,
    Created,
    Loaded,
    Destroyed,
    Failed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    Undefined,
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PackageStatus {
    Undefined,
    Sent,
    Received,
    FailedGeneric,
    FailedNetworkError,
    FailedTimeout,
}

/// Direction a connection is opened for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkKind {
    Send,
    Recv,
    Bidi,
}

/// Properties the plugin reports alongside channel status changes. The core
/// only inspects the current role.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ChannelProps {
    pub role: String,
}

/// Properties the plugin reports alongside link status changes.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LinkProps {
    pub link_address: LinkAddress,
}

// ----------------------------------------------
// Option records
// ----------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    pub send_channel: ChannelId,
    pub send_role: String,
    pub send_address: LinkAddress,
    pub recv_channel: ChannelId,
    pub recv_role: String,
    pub alt_channel: ChannelId,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveOptions {
    pub recv_channel: ChannelId,
    pub recv_role: String,
    pub send_channel: ChannelId,
    pub send_role: String,
    pub alt_channel: ChannelId,
    pub multi_channel: bool,
    pub timeout_ms: u64,
}

/// Replays a saved pair of link addresses and package id to reconstruct a
/// conduit without a handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub send_channel: ChannelId,
    pub send_role: String,
    pub send_address: LinkAddress,
    pub recv_channel: ChannelId,
    pub recv_role: String,
    pub recv_address: LinkAddress,
    pub package_id: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapOptions {
    pub init_send_channel: ChannelId,
    pub init_send_role: String,
    pub init_send_address: LinkAddress,
    pub init_recv_channel: ChannelId,
    pub init_recv_role: String,
    pub init_recv_address: LinkAddress,
    pub final_send_channel: ChannelId,
    pub final_send_role: String,
    pub final_recv_channel: ChannelId,
    pub final_recv_role: String,
    pub timeout_seconds: u64,
}

// ----------------------------------------------
// User callback aliases
// ----------------------------------------------

pub type StatusCallback = Box<dyn FnOnce(ApiStatus) + Send>;
pub type BytesCallback = Box<dyn FnOnce(ApiStatus, Vec<u8>) + Send>;
pub type HandleCallback = Box<dyn FnOnce(ApiStatus, OpHandle) + Send>;
pub type ReceiverCallback = Box<dyn FnOnce(ApiStatus, LinkAddress, OpHandle) + Send>;
/// Receives the decoded message, the address to reply to, and the base64
/// package id replies must be tagged with.
pub type RespondCallback = Box<dyn FnOnce(ApiStatus, Vec<u8>, LinkAddress, String) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_source_starts_at_one() {
        let source = HandleSource::new();
        assert_eq!(source.next(), 1);
        assert_eq!(source.next(), 2);
        assert_eq!(source.next(), 3);
    }

    #[test]
    fn test_handle_source_wraps_to_one() {
        let source = HandleSource::new();
        source.next.store(i64::max_value() as u64 + 1, Ordering::Relaxed);
        assert_eq!(source.next(), 1);
        assert_eq!(source.next(), 2);
    }

    #[test]
    fn test_package_id_prefix() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let id = PackageId::from_prefix(&payload).unwrap();
        assert_eq!(id.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(PackageId::from_prefix(&payload[..7]), None);
    }
}
