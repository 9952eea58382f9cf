use crate::context::{ContextBase, ResumeContext};
use crate::encoding::base64;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::logging::error;
use crate::manager::ManagerInner;
use crate::support::{
    ApiStatus, HandleCallback, OpHandle, PackageId, ResumeOptions, NULL_OP_HANDLE,
};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Reconstructs a conduit from a saved pair of link addresses and package
/// id. No handshake: both links are loaded and the conduit starts as soon
/// as both connections open.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResumeState {
    Initial,
    WaitingForSecondConnection,
    Finished,
    Failed,
}

pub const STATES: &[(ResumeState, bool)] = &[
    (ResumeState::Initial, false),
    (ResumeState::WaitingForSecondConnection, false),
    (ResumeState::Finished, true),
    (ResumeState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<ResumeState> = TransitionTable::new()
        .declare(
            ResumeState::Initial,
            ApiEvent::ConnSmConnected,
            ResumeState::WaitingForSecondConnection,
        )
        .declare(
            ResumeState::WaitingForSecondConnection,
            ApiEvent::ConnSmConnected,
            ResumeState::Finished,
        );
}

pub fn new_context(handle: OpHandle, opts: ResumeOptions, callback: HandleCallback) -> ResumeContext {
    ResumeContext {
        base: ContextBase::new(handle),
        state: ResumeState::Initial,
        opts,
        callback: Some(callback),
        send_sm_handle: NULL_OP_HANDLE,
        send_conn_id: None,
        recv_sm_handle: NULL_OP_HANDLE,
        recv_conn_id: None,
        package_id: None,
    }
}

pub struct ResumeMachine;

impl Machine for ResumeMachine {
    type State = ResumeState;
    type Ctx = ResumeContext;

    const NAME: &'static str = "resume";

    #[inline]
    fn table() -> &'static TransitionTable<ResumeState> {
        &TABLE
    }

    #[inline]
    fn initial() -> ResumeState {
        ResumeState::Initial
    }

    #[inline]
    fn failed() -> ResumeState {
        ResumeState::Failed
    }

    #[inline]
    fn is_final(state: ResumeState) -> bool {
        state == ResumeState::Finished
    }

    #[inline]
    fn state_of(ctx: &ResumeContext) -> ResumeState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut ResumeContext, state: ResumeState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut ResumeContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut ResumeContext, state: ResumeState) -> EventResult {
        match state {
            ResumeState::Initial => enter_initial(mgr, ctx),
            ResumeState::WaitingForSecondConnection => EventResult::Success,
            ResumeState::Finished => enter_finished(mgr, ctx),
            ResumeState::Failed => {
                if let Some(callback) = ctx.callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn validate(mgr: &ManagerInner, ctx: &ResumeContext) -> Result<PackageId, ApiStatus> {
    let opts = &ctx.opts;

    if opts.send_channel.is_empty() || opts.recv_channel.is_empty() {
        error!(mgr.log, "invalid channel id"; "context" => "resume_initial");
        return Err(ApiStatus::ChannelInvalid);
    }
    if opts.send_role.is_empty() || opts.recv_role.is_empty() {
        error!(mgr.log, "invalid role"; "context" => "resume_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if opts.send_address.is_empty() || opts.recv_address.is_empty() {
        error!(mgr.log, "resume requires both saved addresses"; "context" => "resume_initial");
        return Err(ApiStatus::InvalidArgument);
    }
    if mgr.plugin(&opts.send_channel).is_none() || mgr.plugin(&opts.recv_channel).is_none() {
        error!(mgr.log, "failed to get channel"; "context" => "resume_initial");
        return Err(ApiStatus::ChannelInvalid);
    }

    let package_id = base64::decode(&opts.package_id)
        .ok()
        .and_then(|bytes| match bytes.len() == crate::PACKAGE_ID_LEN {
            true => PackageId::from_prefix(&bytes),
            _ => None,
        });

    match package_id {
        Some(package_id) => Ok(package_id),
        None => {
            error!(mgr.log, "invalid saved package id"; "context" => "resume_initial");
            Err(ApiStatus::InvalidArgument)
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut ResumeContext) -> EventResult {
    let package_id = match validate(mgr, ctx) {
        Ok(package_id) => package_id,
        Err(status) => {
            if let Some(callback) = ctx.callback.take() {
                callback(status, NULL_OP_HANDLE);
            }
            return EventResult::NotSupported;
        }
    };
    ctx.package_id = Some(package_id);

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
               "context" => "resume_initial");
        return EventResult::NotSupported;
    }

    ctx.recv_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.opts.recv_channel.clone(),
        &ctx.opts.recv_role.clone(),
        &ctx.opts.recv_address.clone(),
        false,
        false,
    );
    if ctx.recv_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "resume_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.send_sm_handle, ctx.base.handle);
    mgr.register_handle(ctx.recv_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut ResumeContext) -> EventResult {
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
               "context" => "resume_finished");
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
        let problems = TABLE.validate(ResumeState::Initial, ResumeState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
