use crate::engine::ApiEvent;
use crate::machines::bootstrap_dial::BootstrapDialState;
use crate::machines::bootstrap_listen::{BootstrapListenState, BootstrapPreConduitState};
use crate::machines::conduit::ConduitState;
use crate::machines::conn::ConnState;
use crate::machines::dial::DialState;
use crate::machines::listen::ListenState;
use crate::machines::pre_conduit::PreConduitState;
use crate::machines::recv::RecvState;
use crate::machines::resume::ResumeState;
use crate::machines::send::SendState;
use crate::machines::send_receive::SendReceiveState;
use crate::support::{
    BootstrapOptions, BytesCallback, ChannelId, ConnId, HandleCallback, LinkAddress, LinkId,
    OpHandle, PackageId, PackageStatus, ReceiveOptions, ReceiverCallback, ResumeOptions,
    SendOptions, StatusCallback, NULL_OP_HANDLE,
};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::collections::VecDeque;

/// State shared by every per-operation context.
pub struct ContextBase {
    pub handle: OpHandle,
    pub pending: VecDeque<ApiEvent>,
}

impl ContextBase {
    #[inline]
    pub fn new(handle: OpHandle) -> ContextBase {
        ContextBase {
            handle,
            pending: VecDeque::new(),
        }
    }
}

/// One leg of a bootstrap handshake: the connection state machine driving
/// it, the connection it produced, and the link address involved. A zero
/// state-machine handle means the leg is not expected.
#[derive(Default)]
pub struct BootstrapLeg {
    pub sm_handle: OpHandle,
    pub conn_id: Option<ConnId>,
    pub link_address: LinkAddress,
    // True when this side created the link, so the address must travel to
    // the peer in a hello or response envelope.
    pub created: bool,
}

impl BootstrapLeg {
    /// True while the leg is expected but its connection has not opened.
    #[inline]
    pub fn outstanding(&self) -> bool {
        self.sm_handle != NULL_OP_HANDLE && self.conn_id.is_none()
    }

    #[inline]
    pub fn matches(&self, sm_handle: OpHandle) -> bool {
        self.sm_handle == sm_handle && self.sm_handle != NULL_OP_HANDLE
    }
}

// ----------------------------------------------
// Connection state machine context
// ----------------------------------------------

pub struct ConnContext {
    pub base: ContextBase,
    pub state: ConnState,

    pub parent_handle: OpHandle,
    pub channel_id: ChannelId,
    pub role: String,
    pub link_address: LinkAddress,
    pub creating: bool,
    pub sending: bool,

    pub link_id: Option<LinkId>,
    pub conn_id: Option<ConnId>,
    // Address reported by the plugin for links this machine created.
    pub actual_link_address: LinkAddress,

    // Contexts that must release this connection before it may close. The
    // parent is a dependent from birth; only the parent failing takes the
    // machine down with it.
    pub dependents: IndexSet<OpHandle>,
    pub parent_failed: bool,
    // Set while this machine owns a connection-reuse entry.
    pub reuse_key: Option<(ChannelId, String)>,

    pub announced: bool,
    pub close_issued: bool,
    pub conn_destroyed: bool,
    pub destroy_issued: bool,
}

impl ConnContext {
    pub fn new(
        handle: OpHandle,
        parent: OpHandle,
        channel_id: &str,
        role: &str,
        link_address: &str,
        creating: bool,
        sending: bool,
    ) -> ConnContext {
        let mut dependents = IndexSet::new();
        dependents.insert(parent);

        ConnContext {
            base: ContextBase::new(handle),
            state: ConnState::Initial,
            parent_handle: parent,
            channel_id: channel_id.into(),
            role: role.into(),
            link_address: link_address.into(),
            creating,
            sending,
            link_id: None,
            conn_id: None,
            actual_link_address: String::new(),
            dependents,
            parent_failed: false,
            reuse_key: None,
            announced: false,
            close_issued: false,
            conn_destroyed: false,
            destroy_issued: false,
        }
    }
}

// ----------------------------------------------
// Unidirectional operation contexts
// ----------------------------------------------

pub struct SendContext {
    pub base: ContextBase,
    pub state: SendState,

    pub opts: SendOptions,
    pub data: Vec<u8>,
    pub callback: Option<StatusCallback>,

    pub conn_sm_handle: OpHandle,
    pub conn_id: Option<ConnId>,
}

pub struct RecvContext {
    pub base: ContextBase,
    pub state: RecvState,

    // User-facing operation handle, distinct from the context handle so
    // request lookups never collide with dependency registrations.
    pub api_handle: OpHandle,

    pub opts: ReceiveOptions,
    pub receiver_callback: Option<ReceiverCallback>,
    pub read_callback: Option<BytesCallback>,
    pub close_callback: Option<StatusCallback>,

    pub recv_queue: VecDeque<Vec<u8>>,

    pub conn_sm_handle: OpHandle,
    pub conn_id: Option<ConnId>,
    pub link_address: LinkAddress,
    pub cancel_pending: bool,
}

pub struct SendReceiveContext {
    pub base: ContextBase,
    pub state: SendReceiveState,

    pub opts: SendOptions,
    pub data: Vec<u8>,
    pub callback: Option<BytesCallback>,

    pub send_sm_handle: OpHandle,
    pub send_conn_id: Option<ConnId>,
    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: Option<ConnId>,
    pub recv_link_address: LinkAddress,

    pub package_id: Option<PackageId>,
    pub received: Option<Vec<u8>>,
    pub hello_sent: bool,
}

// ----------------------------------------------
// Conduit-producing operation contexts
// ----------------------------------------------

pub struct DialContext {
    pub base: ContextBase,
    pub state: DialState,

    pub opts: SendOptions,
    pub data: Vec<u8>,
    pub callback: Option<HandleCallback>,

    pub send_sm_handle: OpHandle,
    pub send_conn_id: Option<ConnId>,
    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: Option<ConnId>,
    pub recv_link_address: LinkAddress,

    pub package_id: Option<PackageId>,
}

pub struct ResumeContext {
    pub base: ContextBase,
    pub state: ResumeState,

    pub opts: ResumeOptions,
    pub callback: Option<HandleCallback>,

    pub send_sm_handle: OpHandle,
    pub send_conn_id: Option<ConnId>,
    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: Option<ConnId>,

    pub package_id: Option<PackageId>,
}

pub struct ListenContext {
    pub base: ContextBase,
    pub state: ListenState,

    pub api_handle: OpHandle,

    pub opts: ReceiveOptions,
    pub listen_callback: Option<ReceiverCallback>,
    pub accept_callback: Option<HandleCallback>,
    pub close_callback: Option<StatusCallback>,

    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: Option<ConnId>,
    pub recv_link_address: LinkAddress,

    // Raw prefixed payloads awaiting hello parsing.
    pub hello_queue: VecDeque<Vec<u8>>,
    // Pre-conduits ready to be claimed by an accept call, oldest first.
    pub pending_accepts: VecDeque<OpHandle>,
}

pub struct PreConduitContext {
    pub base: ContextBase,
    pub state: PreConduitState,

    pub listen_handle: OpHandle,
    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: ConnId,
    pub recv_channel: ChannelId,
    pub send_channel: ChannelId,
    pub send_role: String,
    pub send_link_address: LinkAddress,
    pub package_id: PackageId,

    pub recv_messages: Vec<Vec<u8>>,
    pub accept_callback: Option<HandleCallback>,

    pub send_sm_handle: OpHandle,
    pub send_conn_id: Option<ConnId>,
}

pub struct ConduitContext {
    pub base: ContextBase,
    pub state: ConduitState,

    pub api_handle: OpHandle,
    pub send_sm_handle: OpHandle,
    pub send_conn_id: ConnId,
    pub recv_sm_handle: OpHandle,
    pub recv_conn_id: ConnId,
    pub send_channel: ChannelId,
    pub recv_channel: ChannelId,
    pub package_id: PackageId,

    // Writes not yet handed to the plugin, paired with their callbacks.
    pub send_queue: VecDeque<(StatusCallback, Vec<u8>)>,
    // Writes in flight: package handle to the callback owed an outcome.
    pub sent_map: HashMap<OpHandle, StatusCallback>,
    // Package handles whose outcome arrived but has not been resolved yet.
    pub sent_list: Vec<OpHandle>,
    pub failed_list: Vec<OpHandle>,

    pub recv_queue: VecDeque<Vec<u8>>,
    pub read_callback: Option<BytesCallback>,
    pub close_callback: Option<StatusCallback>,
}

// ----------------------------------------------
// Bootstrap contexts
// ----------------------------------------------

pub struct BootstrapDialContext {
    pub base: ContextBase,
    pub state: BootstrapDialState,

    pub opts: BootstrapOptions,
    pub data: Vec<u8>,
    pub callback: Option<HandleCallback>,

    pub init_send: BootstrapLeg,
    pub init_recv: BootstrapLeg,
    pub final_send: BootstrapLeg,
    pub final_recv: BootstrapLeg,

    pub package_id: Option<PackageId>,
    pub response_queue: VecDeque<Vec<u8>>,
}

pub struct BootstrapListenContext {
    pub base: ContextBase,
    pub state: BootstrapListenState,

    pub api_handle: OpHandle,

    pub opts: BootstrapOptions,
    pub listen_callback: Option<ReceiverCallback>,
    pub accept_callback: Option<HandleCallback>,
    pub close_callback: Option<StatusCallback>,

    pub init_recv: BootstrapLeg,

    pub hello_queue: VecDeque<Vec<u8>>,
    pub pending_accepts: VecDeque<OpHandle>,
}

pub struct BootstrapPreConduitContext {
    pub base: ContextBase,
    pub state: BootstrapPreConduitState,

    pub listen_handle: OpHandle,
    pub opts: BootstrapOptions,
    pub package_id: PackageId,

    // Legs of the upgrade. init_recv is shared with the listener (no state
    // machine of our own); init_send carries the response.
    pub init_recv_conn_id: ConnId,
    pub init_recv_sm_handle: OpHandle,
    pub init_send: BootstrapLeg,
    pub final_send: BootstrapLeg,
    pub final_recv: BootstrapLeg,

    // Addresses the dialer supplied in its hello, relative to us.
    pub hello_init_send_address: Option<LinkAddress>,
    pub hello_final_send_address: Option<LinkAddress>,
    pub hello_final_recv_address: Option<LinkAddress>,

    pub response_needed: bool,
    pub recv_messages: Vec<Vec<u8>>,
    pub accept_callback: Option<HandleCallback>,
}

// ----------------------------------------------
// The context arena entry
// ----------------------------------------------

/// Every in-flight operation, as a tagged union so the manager can own all
/// of them in one arena and route events without downcasts.
pub enum ApiContext {
    Conn(ConnContext),
    Send(SendContext),
    Recv(RecvContext),
    SendReceive(SendReceiveContext),
    Dial(DialContext),
    Resume(ResumeContext),
    Listen(ListenContext),
    PreConduit(PreConduitContext),
    Conduit(ConduitContext),
    BootstrapDial(BootstrapDialContext),
    BootstrapListen(BootstrapListenContext),
    BootstrapPreConduit(BootstrapPreConduitContext),
}

impl ApiContext {
    #[inline]
    pub fn handle(&self) -> OpHandle {
        self.base().handle
    }

    pub fn base(&self) -> &ContextBase {
        match self {
            ApiContext::Conn(ctx) => &ctx.base,
            ApiContext::Send(ctx) => &ctx.base,
            ApiContext::Recv(ctx) => &ctx.base,
            ApiContext::SendReceive(ctx) => &ctx.base,
            ApiContext::Dial(ctx) => &ctx.base,
            ApiContext::Resume(ctx) => &ctx.base,
            ApiContext::Listen(ctx) => &ctx.base,
            ApiContext::PreConduit(ctx) => &ctx.base,
            ApiContext::Conduit(ctx) => &ctx.base,
            ApiContext::BootstrapDial(ctx) => &ctx.base,
            ApiContext::BootstrapListen(ctx) => &ctx.base,
            ApiContext::BootstrapPreConduit(ctx) => &ctx.base,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiContext::Conn(_) => "conn",
            ApiContext::Send(_) => "send",
            ApiContext::Recv(_) => "recv",
            ApiContext::SendReceive(_) => "send_receive",
            ApiContext::Dial(_) => "dial",
            ApiContext::Resume(_) => "resume",
            ApiContext::Listen(_) => "listen",
            ApiContext::PreConduit(_) => "pre_conduit",
            ApiContext::Conduit(_) => "conduit",
            ApiContext::BootstrapDial(_) => "bootstrap_dial",
            ApiContext::BootstrapListen(_) => "bootstrap_listen",
            ApiContext::BootstrapPreConduit(_) => "bootstrap_pre_conduit",
        }
    }

    // The update methods below are invoked by the manager immediately before
    // it fires the corresponding event, so state transitions read their
    // inputs from context fields rather than event payloads. Variants that
    // do not care about an update ignore it.

    pub fn update_link_status_changed(&mut self, link_id: &LinkId, address: &LinkAddress) {
        if let ApiContext::Conn(ctx) = self {
            if ctx.link_id.is_none() {
                ctx.link_id = Some(link_id.clone());
                ctx.actual_link_address = address.clone();
            }
        }
    }

    pub fn update_connection_status_changed(&mut self, conn_id: &ConnId, open: bool) {
        if let ApiContext::Conn(ctx) = self {
            if open && ctx.conn_id.is_none() {
                ctx.conn_id = Some(conn_id.clone());
            }
            if !open && ctx.conn_id.as_ref() == Some(conn_id) {
                ctx.conn_destroyed = true;
            }
        }
    }

    pub fn update_package_status_changed(&mut self, package_handle: OpHandle, status: PackageStatus) {
        if let ApiContext::Conduit(ctx) = self {
            if status == PackageStatus::Sent {
                ctx.sent_list.push(package_handle);
            } else {
                ctx.failed_list.push(package_handle);
            }
        }
    }

    pub fn update_receive_enc_pkg(&mut self, _conn_id: &ConnId, payload: Vec<u8>) {
        match self {
            ApiContext::Recv(ctx) => ctx.recv_queue.push_back(payload),
            ApiContext::SendReceive(ctx) => {
                if ctx.received.is_none() {
                    ctx.received = Some(payload);
                }
            }
            ApiContext::Listen(ctx) => ctx.hello_queue.push_back(payload),
            ApiContext::PreConduit(ctx) => ctx.recv_messages.push(payload),
            ApiContext::Conduit(ctx) => ctx.recv_queue.push_back(payload),
            ApiContext::BootstrapDial(ctx) => ctx.response_queue.push_back(payload),
            ApiContext::BootstrapListen(ctx) => ctx.hello_queue.push_back(payload),
            ApiContext::BootstrapPreConduit(ctx) => ctx.recv_messages.push(payload),
            _ => (),
        }
    }

    pub fn update_conn_sm_connected(
        &mut self,
        sm_handle: OpHandle,
        conn_id: &ConnId,
        link_address: &LinkAddress,
    ) {
        match self {
            ApiContext::Send(ctx) => {
                if ctx.conn_sm_handle == sm_handle {
                    ctx.conn_id = Some(conn_id.clone());
                }
            }
            ApiContext::Recv(ctx) => {
                if ctx.conn_sm_handle == sm_handle {
                    ctx.conn_id = Some(conn_id.clone());
                    ctx.link_address = link_address.clone();
                }
            }
            ApiContext::SendReceive(ctx) => {
                if ctx.send_sm_handle == sm_handle {
                    ctx.send_conn_id = Some(conn_id.clone());
                } else if ctx.recv_sm_handle == sm_handle {
                    ctx.recv_conn_id = Some(conn_id.clone());
                    ctx.recv_link_address = link_address.clone();
                }
            }
            ApiContext::Dial(ctx) => {
                if ctx.send_sm_handle == sm_handle {
                    ctx.send_conn_id = Some(conn_id.clone());
                } else if ctx.recv_sm_handle == sm_handle {
                    ctx.recv_conn_id = Some(conn_id.clone());
                    ctx.recv_link_address = link_address.clone();
                }
            }
            ApiContext::Resume(ctx) => {
                if ctx.send_sm_handle == sm_handle {
                    ctx.send_conn_id = Some(conn_id.clone());
                } else if ctx.recv_sm_handle == sm_handle {
                    ctx.recv_conn_id = Some(conn_id.clone());
                }
            }
            ApiContext::Listen(ctx) => {
                if ctx.recv_sm_handle == sm_handle {
                    ctx.recv_conn_id = Some(conn_id.clone());
                    ctx.recv_link_address = link_address.clone();
                }
            }
            ApiContext::PreConduit(ctx) => {
                if ctx.send_sm_handle == sm_handle {
                    ctx.send_conn_id = Some(conn_id.clone());
                }
            }
            ApiContext::BootstrapDial(ctx) => {
                for leg in [
                    &mut ctx.init_send,
                    &mut ctx.init_recv,
                    &mut ctx.final_send,
                    &mut ctx.final_recv,
                ]
                .iter_mut()
                {
                    if leg.matches(sm_handle) {
                        leg.conn_id = Some(conn_id.clone());
                        leg.link_address = link_address.clone();
                        break;
                    }
                }
            }
            ApiContext::BootstrapListen(ctx) => {
                if ctx.init_recv.matches(sm_handle) {
                    ctx.init_recv.conn_id = Some(conn_id.clone());
                    ctx.init_recv.link_address = link_address.clone();
                }
            }
            ApiContext::BootstrapPreConduit(ctx) => {
                for leg in [&mut ctx.init_send, &mut ctx.final_send, &mut ctx.final_recv]
                    .iter_mut()
                {
                    if leg.matches(sm_handle) {
                        leg.conn_id = Some(conn_id.clone());
                        leg.link_address = link_address.clone();
                        break;
                    }
                }
            }
            _ => (),
        }
    }

    pub fn update_state_machine_finished(&mut self, finished: OpHandle) {
        if let ApiContext::Conn(ctx) = self {
            ctx.dependents.shift_remove(&finished);
        }
    }

    pub fn update_state_machine_failed(&mut self, failed: OpHandle) {
        if let ApiContext::Conn(ctx) = self {
            if failed == ctx.parent_handle {
                ctx.parent_failed = true;
            }
            ctx.dependents.shift_remove(&failed);
        }
    }

    pub fn update_cancelled(&mut self) {
        if let ApiContext::Recv(ctx) = self {
            ctx.cancel_pending = true;
        }
    }

    pub fn update_dependent(&mut self, dependent: OpHandle) {
        if let ApiContext::Conn(ctx) = self {
            ctx.dependents.insert(dependent);
        }
    }

    pub fn update_detach(&mut self, dependent: OpHandle) {
        if let ApiContext::Conn(ctx) = self {
            ctx.dependents.shift_remove(&dependent);
        }
    }
}
