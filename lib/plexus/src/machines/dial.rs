use crate::context::{ContextBase, DialContext};
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{frame_envelope, HelloEnvelope};
use crate::logging::error;
use crate::machines::send_receive::validate_options;
use crate::manager::ManagerInner;
use crate::support::{ApiStatus, HandleCallback, OpHandle, PackageId, SendOptions, NULL_OP_HANDLE};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Like send-receive, but instead of handing back the response bytes it
/// stands up a conduit bound to the two connections and the package id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DialState {
    Initial,
    WaitingForSecondConnection,
    ConnectionsOpen,
    Finished,
    Failed,
}

pub const STATES: &[(DialState, bool)] = &[
    (DialState::Initial, false),
    (DialState::WaitingForSecondConnection, false),
    (DialState::ConnectionsOpen, false),
    (DialState::Finished, true),
    (DialState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<DialState> = TransitionTable::new()
        .declare(
            DialState::Initial,
            ApiEvent::ConnSmConnected,
            DialState::WaitingForSecondConnection,
        )
        .declare(
            DialState::WaitingForSecondConnection,
            ApiEvent::ConnSmConnected,
            DialState::ConnectionsOpen,
        )
        .declare(DialState::ConnectionsOpen, ApiEvent::PackageSent, DialState::Finished);
}

pub fn new_context(
    handle: OpHandle,
    opts: SendOptions,
    data: Vec<u8>,
    callback: HandleCallback,
) -> DialContext {
    DialContext {
        base: ContextBase::new(handle),
        state: DialState::Initial,
        opts,
        data,
        callback: Some(callback),
        send_sm_handle: NULL_OP_HANDLE,
        send_conn_id: None,
        recv_sm_handle: NULL_OP_HANDLE,
        recv_conn_id: None,
        recv_link_address: String::new(),
        package_id: None,
    }
}

pub struct DialMachine;

impl Machine for DialMachine {
    type State = DialState;
    type Ctx = DialContext;

    const NAME: &'static str = "dial";

    #[inline]
    fn table() -> &'static TransitionTable<DialState> {
        &TABLE
    }

    #[inline]
    fn initial() -> DialState {
        DialState::Initial
    }

    #[inline]
    fn failed() -> DialState {
        DialState::Failed
    }

    #[inline]
    fn is_final(state: DialState) -> bool {
        state == DialState::Finished
    }

    #[inline]
    fn state_of(ctx: &DialContext) -> DialState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut DialContext, state: DialState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut DialContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut DialContext, state: DialState) -> EventResult {
        match state {
            DialState::Initial => enter_initial(mgr, ctx),
            DialState::WaitingForSecondConnection => EventResult::Success,
            DialState::ConnectionsOpen => enter_connections_open(mgr, ctx),
            DialState::Finished => enter_finished(mgr, ctx),
            DialState::Failed => {
                if let Some(callback) = ctx.callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut DialContext) -> EventResult {
    if let Err(status) = validate_options(mgr, &ctx.opts) {
        if let Some(callback) = ctx.callback.take() {
            callback(status, NULL_OP_HANDLE);
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
               "context" => "dial_initial");
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
               "context" => "dial_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.send_sm_handle, ctx.base.handle);
    mgr.register_handle(ctx.recv_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_connections_open(mgr: &mut ManagerInner, ctx: &mut DialContext) -> EventResult {
    let plugin = match mgr.plugin(&ctx.opts.send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let package_id = match ctx.package_id {
        Some(package_id) => package_id,
        None => return EventResult::NotSupported,
    };

    let send_conn = match &ctx.send_conn_id {
        Some(send_conn) => send_conn.clone(),
        None => return EventResult::NotSupported,
    };

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
                   "context" => "dial_connections_open", "conn_id" => %send_conn);
            EventResult::NotSupported
        }
    }
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut DialContext) -> EventResult {
    let package_id = match ctx.package_id {
        Some(package_id) => package_id,
        None => return EventResult::NotSupported,
    };

    let (send_conn, recv_conn) = match (&ctx.send_conn_id, &ctx.recv_conn_id) {
        (Some(send_conn), Some(recv_conn)) => (send_conn.clone(), recv_conn.clone()),
        _ => return EventResult::NotSupported,
    };

    let api_handle = mgr.next_handle();
    let conduit_handle = mgr.start_conduit_state_machine(
        ctx.base.handle,
        ctx.recv_sm_handle,
        &recv_conn,
        ctx.send_sm_handle,
        &send_conn,
        &ctx.opts.send_channel.clone(),
        &ctx.opts.recv_channel.clone(),
        package_id,
        Vec::new(),
        api_handle,
    );
    if conduit_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting conduit state machine failed";
               "context" => "dial_finished");
        return EventResult::NotSupported;
    }

    let callback = match ctx.callback.take() {
        Some(callback) => callback,
        None => return EventResult::NotSupported,
    };
    callback(ApiStatus::Ok, api_handle);

    mgr.state_machine_finished(ctx.base.handle);
    EventResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(DialState::Initial, DialState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
