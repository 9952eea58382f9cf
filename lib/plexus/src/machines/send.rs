use crate::context::{ContextBase, SendContext};
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::logging::error;
use crate::manager::ManagerInner;
use crate::support::{ApiStatus, OpHandle, SendOptions, StatusCallback, NULL_OP_HANDLE};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// One-shot unidirectional send: one sending connection, one package.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SendState {
    Initial,
    Sending,
    Finished,
    Failed,
}

pub const STATES: &[(SendState, bool)] = &[
    (SendState::Initial, false),
    (SendState::Sending, false),
    (SendState::Finished, true),
    (SendState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<SendState> = TransitionTable::new()
        .declare(SendState::Initial, ApiEvent::ConnSmConnected, SendState::Sending)
        .declare(SendState::Sending, ApiEvent::PackageSent, SendState::Finished);
}

pub fn new_context(
    handle: OpHandle,
    opts: SendOptions,
    data: Vec<u8>,
    callback: StatusCallback,
) -> SendContext {
    SendContext {
        base: ContextBase::new(handle),
        state: SendState::Initial,
        opts,
        data,
        callback: Some(callback),
        conn_sm_handle: NULL_OP_HANDLE,
        conn_id: None,
    }
}

pub struct SendMachine;

impl Machine for SendMachine {
    type State = SendState;
    type Ctx = SendContext;

    const NAME: &'static str = "send";

    #[inline]
    fn table() -> &'static TransitionTable<SendState> {
        &TABLE
    }

    #[inline]
    fn initial() -> SendState {
        SendState::Initial
    }

    #[inline]
    fn failed() -> SendState {
        SendState::Failed
    }

    #[inline]
    fn is_final(state: SendState) -> bool {
        state == SendState::Finished
    }

    #[inline]
    fn state_of(ctx: &SendContext) -> SendState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut SendContext, state: SendState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut SendContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut SendContext, state: SendState) -> EventResult {
        match state {
            SendState::Initial => enter_initial(mgr, ctx),
            SendState::Sending => enter_sending(mgr, ctx),
            SendState::Finished => {
                let callback = match ctx.callback.take() {
                    Some(callback) => callback,
                    None => return EventResult::NotSupported,
                };
                callback(ApiStatus::Ok);
                mgr.state_machine_finished(ctx.base.handle);
                EventResult::Success
            }
            SendState::Failed => {
                if let Some(callback) = ctx.callback.take() {
                    callback(ApiStatus::InternalError);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut SendContext) -> EventResult {
    if let Err(status) = validate(mgr, ctx) {
        if let Some(callback) = ctx.callback.take() {
            callback(status);
        }
        return EventResult::NotSupported;
    }

    ctx.conn_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.opts.send_channel.clone(),
        &ctx.opts.send_role.clone(),
        &ctx.opts.send_address.clone(),
        false,
        true,
    );

    if ctx.conn_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "send_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.conn_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn validate(mgr: &ManagerInner, ctx: &SendContext) -> Result<(), ApiStatus> {
    if ctx.opts.send_channel.is_empty() {
        error!(mgr.log, "invalid send channel id"; "context" => "send_initial");
        return Err(ApiStatus::ChannelInvalid);
    }
    if ctx.opts.send_role.is_empty() {
        error!(mgr.log, "invalid send role"; "context" => "send_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if ctx.opts.send_address.is_empty() {
        error!(mgr.log, "invalid send address"; "context" => "send_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if mgr.plugin(&ctx.opts.send_channel).is_none() {
        error!(mgr.log, "failed to get channel";
               "context" => "send_initial", "channel_id" => %ctx.opts.send_channel);
        return Err(ApiStatus::ChannelInvalid);
    }
    Ok(())
}

fn enter_sending(mgr: &mut ManagerInner, ctx: &mut SendContext) -> EventResult {
    let plugin = match mgr.plugin(&ctx.opts.send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let conn_id = match &ctx.conn_id {
        Some(conn_id) => conn_id.clone(),
        None => return EventResult::NotSupported,
    };

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    let package = std::mem::take(&mut ctx.data);
    match plugin.send_package(request, &conn_id, package, 0.0, 0).is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "send package rejected";
                   "context" => "send_sending", "conn_id" => %conn_id);
            EventResult::NotSupported
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(SendState::Initial, SendState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
