use crate::context::PreConduitContext;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::logging::error;
use crate::manager::ManagerInner;
use crate::support::{ApiStatus, NULL_OP_HANDLE};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// A prospective accept target spawned from a hello on a listening
/// connection. Buffers packages tagged for its package id until an accept
/// call upgrades it into a full conduit with its own sending connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PreConduitState {
    Initial,
    Waiting,
    Connecting,
    Finished,
    Failed,
}

pub const STATES: &[(PreConduitState, bool)] = &[
    (PreConduitState::Initial, false),
    (PreConduitState::Waiting, false),
    (PreConduitState::Connecting, false),
    (PreConduitState::Finished, true),
    (PreConduitState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<PreConduitState> = TransitionTable::new()
        .declare(PreConduitState::Initial, ApiEvent::Always, PreConduitState::Waiting)
        .declare(PreConduitState::Waiting, ApiEvent::ReceivePackage, PreConduitState::Waiting)
        .declare(
            PreConduitState::Waiting,
            ApiEvent::ListenAccepted,
            PreConduitState::Connecting,
        )
        .declare(
            PreConduitState::Connecting,
            ApiEvent::ReceivePackage,
            PreConduitState::Connecting,
        )
        .declare(
            PreConduitState::Connecting,
            ApiEvent::ConnSmConnected,
            PreConduitState::Finished,
        );
}

pub struct PreConduitMachine;

impl Machine for PreConduitMachine {
    type State = PreConduitState;
    type Ctx = PreConduitContext;

    const NAME: &'static str = "pre_conduit";

    #[inline]
    fn table() -> &'static TransitionTable<PreConduitState> {
        &TABLE
    }

    #[inline]
    fn initial() -> PreConduitState {
        PreConduitState::Initial
    }

    #[inline]
    fn failed() -> PreConduitState {
        PreConduitState::Failed
    }

    #[inline]
    fn is_final(state: PreConduitState) -> bool {
        state == PreConduitState::Finished
    }

    #[inline]
    fn state_of(ctx: &PreConduitContext) -> PreConduitState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut PreConduitContext, state: PreConduitState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut PreConduitContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(
        mgr: &mut ManagerInner,
        ctx: &mut PreConduitContext,
        state: PreConduitState,
    ) -> EventResult {
        match state {
            PreConduitState::Initial => {
                // Claim the package id so follow-on traffic for this
                // prospective conduit is buffered here.
                let drained = mgr.register_package_id(
                    ctx.package_id,
                    &ctx.recv_conn_id.clone(),
                    ctx.base.handle,
                );
                ctx.recv_messages.extend(drained);

                ctx.base.pending.push_back(ApiEvent::Always);
                EventResult::Success
            }
            PreConduitState::Waiting => EventResult::Success,
            PreConduitState::Connecting => enter_connecting(mgr, ctx),
            PreConduitState::Finished => enter_finished(mgr, ctx),
            PreConduitState::Failed => {
                if let Some(callback) = ctx.accept_callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_connecting(mgr: &mut ManagerInner, ctx: &mut PreConduitContext) -> EventResult {
    if ctx.send_link_address.is_empty() {
        error!(mgr.log, "hello carried no reply address"; "context" => "pre_conduit_connecting");
        return EventResult::NotSupported;
    }

    ctx.send_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.send_channel.clone(),
        &ctx.send_role.clone(),
        &ctx.send_link_address.clone(),
        false,
        true,
    );
    if ctx.send_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "pre_conduit_connecting");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.send_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut PreConduitContext) -> EventResult {
    let send_conn_id = match &ctx.send_conn_id {
        Some(conn_id) => conn_id.clone(),
        None => return EventResult::NotSupported,
    };

    let api_handle = mgr.next_handle();
    let conduit_handle = mgr.start_conduit_state_machine(
        ctx.base.handle,
        ctx.recv_sm_handle,
        &ctx.recv_conn_id.clone(),
        ctx.send_sm_handle,
        &send_conn_id,
        &ctx.send_channel.clone(),
        &ctx.recv_channel.clone(),
        ctx.package_id,
        std::mem::take(&mut ctx.recv_messages),
        api_handle,
    );
    if conduit_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting conduit state machine failed";
               "context" => "pre_conduit_finished");
        return EventResult::NotSupported;
    }

    let callback = match ctx.accept_callback.take() {
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
        let problems = TABLE.validate(PreConduitState::Initial, PreConduitState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
