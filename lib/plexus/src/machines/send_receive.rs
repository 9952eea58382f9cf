use crate::context::{ContextBase, SendReceiveContext};
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{frame_envelope, HelloEnvelope};
use crate::logging::error;
use crate::manager::ManagerInner;
use crate::support::{ApiStatus, BytesCallback, OpHandle, PackageId, SendOptions, NULL_OP_HANDLE};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Round trip over a fresh pair of connections: load the peer's link for
/// sending, create a link for receiving, send a framed hello carrying the
/// receive address and a fresh package id, and deliver the single tagged
/// response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SendReceiveState {
    Initial,
    WaitingForSecondConnection,
    ConnectionsOpen,
    PackageSent,
    Finished,
    Failed,
}

pub const STATES: &[(SendReceiveState, bool)] = &[
    (SendReceiveState::Initial, false),
    (SendReceiveState::WaitingForSecondConnection, false),
    (SendReceiveState::ConnectionsOpen, false),
    (SendReceiveState::PackageSent, false),
    (SendReceiveState::Finished, true),
    (SendReceiveState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<SendReceiveState> = TransitionTable::new()
        .declare(
            SendReceiveState::Initial,
            ApiEvent::ConnSmConnected,
            SendReceiveState::WaitingForSecondConnection,
        )
        .declare(
            SendReceiveState::WaitingForSecondConnection,
            ApiEvent::ConnSmConnected,
            SendReceiveState::ConnectionsOpen,
        )
        // The response can overtake the send acknowledgement.
        .declare(
            SendReceiveState::ConnectionsOpen,
            ApiEvent::ReceivePackage,
            SendReceiveState::ConnectionsOpen,
        )
        .declare(
            SendReceiveState::ConnectionsOpen,
            ApiEvent::PackageSent,
            SendReceiveState::PackageSent,
        )
        .declare(
            SendReceiveState::PackageSent,
            ApiEvent::ReceivePackage,
            SendReceiveState::Finished,
        );
}

pub fn new_context(
    handle: OpHandle,
    opts: SendOptions,
    data: Vec<u8>,
    callback: BytesCallback,
) -> SendReceiveContext {
    SendReceiveContext {
        base: ContextBase::new(handle),
        state: SendReceiveState::Initial,
        opts,
        data,
        callback: Some(callback),
        send_sm_handle: NULL_OP_HANDLE,
        send_conn_id: None,
        recv_sm_handle: NULL_OP_HANDLE,
        recv_conn_id: None,
        recv_link_address: String::new(),
        package_id: None,
        received: None,
        hello_sent: false,
    }
}

pub struct SendReceiveMachine;

impl Machine for SendReceiveMachine {
    type State = SendReceiveState;
    type Ctx = SendReceiveContext;

    const NAME: &'static str = "send_receive";

    #[inline]
    fn table() -> &'static TransitionTable<SendReceiveState> {
        &TABLE
    }

    #[inline]
    fn initial() -> SendReceiveState {
        SendReceiveState::Initial
    }

    #[inline]
    fn failed() -> SendReceiveState {
        SendReceiveState::Failed
    }

    #[inline]
    fn is_final(state: SendReceiveState) -> bool {
        state == SendReceiveState::Finished
    }

    #[inline]
    fn state_of(ctx: &SendReceiveContext) -> SendReceiveState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut SendReceiveContext, state: SendReceiveState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut SendReceiveContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(
        mgr: &mut ManagerInner,
        ctx: &mut SendReceiveContext,
        state: SendReceiveState,
    ) -> EventResult {
        match state {
            SendReceiveState::Initial => enter_initial(mgr, ctx),
            SendReceiveState::WaitingForSecondConnection => EventResult::Success,
            SendReceiveState::ConnectionsOpen => enter_connections_open(mgr, ctx),
            SendReceiveState::PackageSent => {
                // A response that arrived before the send acknowledgement is
                // already queued.
                if ctx.received.is_some() {
                    ctx.base.pending.push_back(ApiEvent::ReceivePackage);
                }
                EventResult::Success
            }
            SendReceiveState::Finished => enter_finished(mgr, ctx),
            SendReceiveState::Failed => {
                if let Some(callback) = ctx.callback.take() {
                    callback(ApiStatus::InternalError, Vec::new());
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

pub(crate) fn validate_options(mgr: &ManagerInner, opts: &SendOptions) -> Result<(), ApiStatus> {
    if opts.send_channel.is_empty() {
        error!(mgr.log, "invalid send channel id"; "context" => "send_receive_initial");
        return Err(ApiStatus::ChannelInvalid);
    }
    if opts.recv_channel.is_empty() {
        error!(mgr.log, "invalid recv channel id"; "context" => "send_receive_initial");
        return Err(ApiStatus::ChannelInvalid);
    }
    if opts.send_role.is_empty() {
        error!(mgr.log, "invalid send role"; "context" => "send_receive_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if opts.recv_role.is_empty() {
        error!(mgr.log, "invalid recv role"; "context" => "send_receive_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if opts.send_address.is_empty() {
        error!(mgr.log, "invalid send address"; "context" => "send_receive_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if mgr.plugin(&opts.send_channel).is_none() || mgr.plugin(&opts.recv_channel).is_none() {
        error!(mgr.log, "failed to get channel"; "context" => "send_receive_initial");
        return Err(ApiStatus::ChannelInvalid);
    }
    Ok(())
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut SendReceiveContext) -> EventResult {
    if let Err(status) = validate_options(mgr, &ctx.opts) {
        if let Some(callback) = ctx.callback.take() {
            callback(status, Vec::new());
        }
        return EventResult::NotSupported;
    }

    ctx.package_id = Some(mgr.random_package_id());

    ctx.send_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.opts.send_channel.clone(),
        &ctx.opts.send_role.clone(),
        &ctx.opts.send_address.clone(),
        false,
        true,
    );
    if ctx.send_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "send_receive_initial");
        return EventResult::NotSupported;
    }

    ctx.recv_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.opts.recv_channel.clone(),
        &ctx.opts.recv_role.clone(),
        &String::new(),
        true,
        false,
    );
    if ctx.recv_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "send_receive_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.send_sm_handle, ctx.base.handle);
    mgr.register_handle(ctx.recv_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_connections_open(mgr: &mut ManagerInner, ctx: &mut SendReceiveContext) -> EventResult {
    // Re-entered when the response overtakes the send acknowledgement; the
    // hello goes out once.
    if ctx.hello_sent {
        return EventResult::Success;
    }
    ctx.hello_sent = true;

    let plugin = match mgr.plugin(&ctx.opts.send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let package_id = match ctx.package_id {
        Some(package_id) => package_id,
        None => return EventResult::NotSupported,
    };

    let (send_conn, recv_conn) = match (&ctx.send_conn_id, &ctx.recv_conn_id) {
        (Some(send_conn), Some(recv_conn)) => (send_conn.clone(), recv_conn.clone()),
        _ => return EventResult::NotSupported,
    };

    // Listen for the tagged response before the hello leaves; early
    // responses are buffered against the package id either way.
    for payload in mgr.register_package_id(package_id, &recv_conn, ctx.base.handle) {
        if ctx.received.is_none() {
            ctx.received = Some(payload);
        }
        ctx.base.pending.push_back(ApiEvent::ReceivePackage);
    }

    let hello = HelloEnvelope::new(
        package_id,
        &ctx.recv_link_address,
        &ctx.opts.recv_channel,
        &std::mem::take(&mut ctx.data),
    );
    let package = frame_envelope(PackageId::zero(), &hello);

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    match plugin.send_package(request, &send_conn, package, 0.0, 0).is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "send package rejected";
                   "context" => "send_receive_connections_open", "conn_id" => %send_conn);
            EventResult::NotSupported
        }
    }
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut SendReceiveContext) -> EventResult {
    let callback = match ctx.callback.take() {
        Some(callback) => callback,
        None => {
            error!(mgr.log, "no callback to deliver response to";
                   "context" => "send_receive_finished");
            return EventResult::NotSupported;
        }
    };

    let received = ctx.received.take().unwrap_or_default();
    callback(ApiStatus::Ok, received);
    mgr.state_machine_finished(ctx.base.handle);
    EventResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(SendReceiveState::Initial, SendReceiveState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
