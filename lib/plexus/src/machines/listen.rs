use crate::context::{ContextBase, ListenContext};
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{parse_envelope, HelloEnvelope};
use crate::logging::{error, info, warn};
use crate::manager::ManagerInner;
use crate::support::{
    ApiStatus, OpHandle, ReceiveOptions, ReceiverCallback, NULL_OP_HANDLE,
};
use crate::PACKAGE_ID_LEN;
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Standing accept endpoint: one created receive link; every well-formed
/// hello that arrives on it becomes a pre-conduit waiting for an accept
/// call.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ListenState {
    Initial,
    Listening,
    Finished,
    Failed,
}

pub const STATES: &[(ListenState, bool)] = &[
    (ListenState::Initial, false),
    (ListenState::Listening, false),
    (ListenState::Finished, true),
    (ListenState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<ListenState> = TransitionTable::new()
        .declare(ListenState::Initial, ApiEvent::ConnSmConnected, ListenState::Listening)
        .declare(ListenState::Listening, ApiEvent::ReceivePackage, ListenState::Listening)
        .declare(ListenState::Listening, ApiEvent::Accept, ListenState::Listening)
        .declare(ListenState::Listening, ApiEvent::Close, ListenState::Finished);
}

pub fn new_context(
    handle: OpHandle,
    opts: ReceiveOptions,
    callback: ReceiverCallback,
) -> ListenContext {
    ListenContext {
        base: ContextBase::new(handle),
        state: ListenState::Initial,
        api_handle: NULL_OP_HANDLE,
        opts,
        listen_callback: Some(callback),
        accept_callback: None,
        close_callback: None,
        recv_sm_handle: NULL_OP_HANDLE,
        recv_conn_id: None,
        recv_link_address: String::new(),
        hello_queue: VecDeque::new(),
        pending_accepts: VecDeque::new(),
    }
}

pub struct ListenMachine;

impl Machine for ListenMachine {
    type State = ListenState;
    type Ctx = ListenContext;

    const NAME: &'static str = "listen";

    #[inline]
    fn table() -> &'static TransitionTable<ListenState> {
        &TABLE
    }

    #[inline]
    fn initial() -> ListenState {
        ListenState::Initial
    }

    #[inline]
    fn failed() -> ListenState {
        ListenState::Failed
    }

    #[inline]
    fn is_final(state: ListenState) -> bool {
        state == ListenState::Finished
    }

    #[inline]
    fn state_of(ctx: &ListenContext) -> ListenState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut ListenContext, state: ListenState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut ListenContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut ListenContext, state: ListenState) -> EventResult {
        match state {
            ListenState::Initial => enter_initial(mgr, ctx),
            ListenState::Listening => enter_listening(mgr, ctx),
            ListenState::Finished => {
                if let Some(callback) = ctx.accept_callback.take() {
                    callback(ApiStatus::Closing, NULL_OP_HANDLE);
                }
                if let Some(callback) = ctx.close_callback.take() {
                    callback(ApiStatus::Ok);
                }
                mgr.state_machine_finished(ctx.base.handle);
                EventResult::Success
            }
            ListenState::Failed => {
                if let Some(callback) = ctx.listen_callback.take() {
                    callback(ApiStatus::InternalError, String::new(), NULL_OP_HANDLE);
                }
                if let Some(callback) = ctx.accept_callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                if let Some(callback) = ctx.close_callback.take() {
                    callback(ApiStatus::InternalError);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut ListenContext) -> EventResult {
    if ctx.opts.recv_channel.is_empty() {
        error!(mgr.log, "invalid recv channel id"; "context" => "listen_initial");
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }
    if ctx.opts.recv_role.is_empty() {
        error!(mgr.log, "invalid recv role"; "context" => "listen_initial");
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::InvalidArgument, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }
    if mgr.plugin(&ctx.opts.recv_channel).is_none() {
        error!(mgr.log, "failed to get channel";
               "context" => "listen_initial", "channel_id" => %ctx.opts.recv_channel);
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
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
               "context" => "listen_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.recv_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_listening(mgr: &mut ManagerInner, ctx: &mut ListenContext) -> EventResult {
    // First entry announces the listening address.
    if let Some(callback) = ctx.listen_callback.take() {
        let conn_id = match &ctx.recv_conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        ctx.api_handle = mgr.next_handle();
        mgr.register_handle(ctx.api_handle, ctx.base.handle);
        mgr.register_id(&conn_id, ctx.base.handle);

        info!(mgr.log, "listening";
              "context" => "listen_listening",
              "channel_id" => %ctx.opts.recv_channel,
              "conn_id" => %conn_id);

        callback(ApiStatus::Ok, ctx.recv_link_address.clone(), ctx.api_handle);
    }

    // Every queued hello becomes a pre-conduit waiting for an accept.
    while let Some(raw) = ctx.hello_queue.pop_front() {
        if raw.len() < PACKAGE_ID_LEN {
            warn!(mgr.log, "undersized hello"; "context" => "listen_listening");
            continue;
        }

        let envelope: HelloEnvelope = match parse_envelope(&raw[PACKAGE_ID_LEN..]) {
            Some(envelope) => envelope,
            None => {
                warn!(mgr.log, "malformed hello"; "context" => "listen_listening");
                continue;
            }
        };

        let package_id = match envelope.package_id() {
            Some(package_id) => package_id,
            None => {
                warn!(mgr.log, "hello without package id"; "context" => "listen_listening");
                continue;
            }
        };

        if !ctx.opts.send_channel.is_empty()
            && envelope.reply_channel != ctx.opts.send_channel
            && !ctx.opts.multi_channel
        {
            warn!(mgr.log, "hello requests unexpected reply channel";
                  "context" => "listen_listening",
                  "reply_channel" => %envelope.reply_channel);
            continue;
        }

        let recv_conn_id = match &ctx.recv_conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        let mut recv_messages = Vec::new();
        match envelope.message_bytes() {
            Some(message) => {
                if !message.is_empty() {
                    recv_messages.push(message);
                }
            }
            None => {
                warn!(mgr.log, "hello with undecodable message"; "context" => "listen_listening");
                continue;
            }
        }

        let pre_handle = mgr.start_pre_conduit_state_machine(
            ctx.base.handle,
            ctx.recv_sm_handle,
            &recv_conn_id,
            &ctx.opts.recv_channel.clone(),
            &envelope.reply_channel,
            &ctx.opts.send_role.clone(),
            &envelope.link_address,
            package_id,
            recv_messages,
        );
        if pre_handle == NULL_OP_HANDLE {
            warn!(mgr.log, "pre-conduit failed to start"; "context" => "listen_listening");
            continue;
        }

        ctx.pending_accepts.push_back(pre_handle);
    }

    // Hand the oldest waiting pre-conduit to a pending accept call.
    if ctx.accept_callback.is_some() && !ctx.pending_accepts.is_empty() {
        let callback = ctx.accept_callback.take().expect("accept callback vanished");
        let pre_handle = ctx.pending_accepts.pop_front().expect("accept queue vanished");
        mgr.listen_accept(pre_handle, callback);
    }

    EventResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(ListenState::Initial, ListenState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
