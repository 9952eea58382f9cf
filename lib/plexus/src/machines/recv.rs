use crate::context::{ContextBase, RecvContext};
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{parse_envelope, HelloEnvelope};
use crate::logging::{error, info};
use crate::manager::ManagerInner;
use crate::support::{
    ApiStatus, ChannelId, LinkAddress, OpHandle, ReceiveOptions, ReceiverCallback, NULL_OP_HANDLE,
};
use crate::PACKAGE_ID_LEN;
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Standing receive endpoint: one created receive link whose address is
/// handed to the caller, then package delivery on demand. Receive requests
/// and packages pair up in arrival order; a cancelled pending request is
/// released with a timeout.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecvState {
    Initial,
    Open,
    Finished,
    Failed,
}

pub const STATES: &[(RecvState, bool)] = &[
    (RecvState::Initial, false),
    (RecvState::Open, false),
    (RecvState::Finished, true),
    (RecvState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<RecvState> = TransitionTable::new()
        .declare(RecvState::Initial, ApiEvent::ConnSmConnected, RecvState::Open)
        .declare(RecvState::Open, ApiEvent::ReceiveRequest, RecvState::Open)
        .declare(RecvState::Open, ApiEvent::ReceivePackage, RecvState::Open)
        .declare(RecvState::Open, ApiEvent::Cancelled, RecvState::Open)
        .declare(RecvState::Open, ApiEvent::Close, RecvState::Finished);
}

pub fn new_context(
    handle: OpHandle,
    opts: ReceiveOptions,
    callback: ReceiverCallback,
) -> RecvContext {
    RecvContext {
        base: ContextBase::new(handle),
        state: RecvState::Initial,
        api_handle: NULL_OP_HANDLE,
        opts,
        receiver_callback: Some(callback),
        read_callback: None,
        close_callback: None,
        recv_queue: VecDeque::new(),
        conn_sm_handle: NULL_OP_HANDLE,
        conn_id: None,
        link_address: String::new(),
        cancel_pending: false,
    }
}

/// Decodes the reply envelope used by `receive_respond`: the message bytes,
/// the address to respond to, and the base64 package id a reply must be
/// tagged with. The framed hello arrives with its zero tag still attached;
/// the tag is skipped before parsing.
pub fn parse_respond_envelope(
    payload: &[u8],
    send_channel: &ChannelId,
    multi_channel: bool,
) -> Result<(Vec<u8>, LinkAddress, String), ApiStatus> {
    let zero_prefixed = payload.len() >= PACKAGE_ID_LEN
        && payload[..PACKAGE_ID_LEN].iter().all(|byte| *byte == 0);
    let body = match zero_prefixed {
        true => &payload[PACKAGE_ID_LEN..],
        _ => payload,
    };

    let envelope: HelloEnvelope = match parse_envelope(body) {
        Some(envelope) => envelope,
        None => return Err(ApiStatus::InternalError),
    };

    if envelope.reply_channel != *send_channel && !multi_channel {
        return Err(ApiStatus::InternalError);
    }

    let message = match envelope.message_bytes() {
        Some(message) => message,
        None => return Err(ApiStatus::InternalError),
    };

    Ok((message, envelope.link_address, envelope.package_id))
}

pub struct RecvMachine;

impl Machine for RecvMachine {
    type State = RecvState;
    type Ctx = RecvContext;

    const NAME: &'static str = "recv";

    #[inline]
    fn table() -> &'static TransitionTable<RecvState> {
        &TABLE
    }

    #[inline]
    fn initial() -> RecvState {
        RecvState::Initial
    }

    #[inline]
    fn failed() -> RecvState {
        RecvState::Failed
    }

    #[inline]
    fn is_final(state: RecvState) -> bool {
        state == RecvState::Finished
    }

    #[inline]
    fn state_of(ctx: &RecvContext) -> RecvState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut RecvContext, state: RecvState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut RecvContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut RecvContext, state: RecvState) -> EventResult {
        match state {
            RecvState::Initial => enter_initial(mgr, ctx),
            RecvState::Open => enter_open(mgr, ctx),
            RecvState::Finished => {
                if let Some(callback) = ctx.read_callback.take() {
                    callback(ApiStatus::Closing, Vec::new());
                }
                if let Some(callback) = ctx.close_callback.take() {
                    callback(ApiStatus::Ok);
                }
                mgr.state_machine_finished(ctx.base.handle);
                EventResult::Success
            }
            RecvState::Failed => {
                if let Some(callback) = ctx.receiver_callback.take() {
                    callback(ApiStatus::InternalError, String::new(), NULL_OP_HANDLE);
                }
                if let Some(callback) = ctx.read_callback.take() {
                    callback(ApiStatus::InternalError, Vec::new());
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

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut RecvContext) -> EventResult {
    if ctx.opts.recv_channel.is_empty() {
        error!(mgr.log, "invalid recv channel id"; "context" => "recv_initial");
        if let Some(callback) = ctx.receiver_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }
    if ctx.opts.recv_role.is_empty() {
        error!(mgr.log, "invalid recv role"; "context" => "recv_initial");
        if let Some(callback) = ctx.receiver_callback.take() {
            callback(ApiStatus::InvalidArgument, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }
    if mgr.plugin(&ctx.opts.recv_channel).is_none() {
        error!(mgr.log, "failed to get channel";
               "context" => "recv_initial", "channel_id" => %ctx.opts.recv_channel);
        if let Some(callback) = ctx.receiver_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }

    ctx.conn_sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &ctx.opts.recv_channel.clone(),
        &ctx.opts.recv_role.clone(),
        &String::new(),
        true,
        false,
    );
    if ctx.conn_sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "recv_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.conn_sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_open(mgr: &mut ManagerInner, ctx: &mut RecvContext) -> EventResult {
    // First entry hands the receive address back to the caller and starts
    // listening on the connection.
    if let Some(callback) = ctx.receiver_callback.take() {
        let conn_id = match &ctx.conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        ctx.api_handle = mgr.next_handle();
        mgr.register_handle(ctx.api_handle, ctx.base.handle);
        mgr.register_id(&conn_id, ctx.base.handle);

        info!(mgr.log, "receive endpoint open";
              "context" => "recv_open",
              "channel_id" => %ctx.opts.recv_channel,
              "conn_id" => %conn_id);

        callback(ApiStatus::Ok, ctx.link_address.clone(), ctx.api_handle);
    }

    // A cancelled blocking request is released before any later package can
    // claim it.
    if ctx.cancel_pending {
        ctx.cancel_pending = false;
        if let Some(callback) = ctx.read_callback.take() {
            callback(ApiStatus::Timeout, Vec::new());
        }
    }

    // Pair a waiting request with a queued package.
    if ctx.read_callback.is_some() && !ctx.recv_queue.is_empty() {
        let callback = ctx.read_callback.take().expect("read callback vanished");
        let payload = ctx.recv_queue.pop_front().expect("recv queue vanished");
        callback(ApiStatus::Ok, payload);
    }

    EventResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(RecvState::Initial, RecvState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn test_parse_respond_envelope_strips_zero_tag() {
        let hello = HelloEnvelope::new(
            crate::support::PackageId::new([5; PACKAGE_ID_LEN]),
            "replyAddr",
            "sendChannel",
            b"payload",
        );
        let framed = crate::frame::frame_envelope(crate::support::PackageId::zero(), &hello);

        let (message, address, package_id) =
            parse_respond_envelope(&framed, &"sendChannel".to_string(), false).unwrap();
        assert_eq!(message, b"payload");
        assert_eq!(address, "replyAddr");
        assert_eq!(
            crate::encoding::base64::decode(&package_id).unwrap(),
            [5; PACKAGE_ID_LEN]
        );
    }

    #[test]
    fn test_parse_respond_envelope_checks_reply_channel() {
        let hello = HelloEnvelope::new(
            crate::support::PackageId::new([5; PACKAGE_ID_LEN]),
            "replyAddr",
            "otherChannel",
            b"payload",
        );
        let json = serde_json::to_vec(&hello).unwrap();

        let result = parse_respond_envelope(&json, &"sendChannel".to_string(), false);
        assert_eq!(result.unwrap_err(), ApiStatus::InternalError);

        // Multi-channel receivers accept replies on any channel.
        let result = parse_respond_envelope(&json, &"sendChannel".to_string(), true);
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_respond_envelope_rejects_bad_message() {
        let mut hello = HelloEnvelope::new(
            crate::support::PackageId::new([5; PACKAGE_ID_LEN]),
            "replyAddr",
            "sendChannel",
            b"payload",
        );
        hello.message = "not base64!".into();
        let json = serde_json::to_vec(&hello).unwrap();

        let result = parse_respond_envelope(&json, &"sendChannel".to_string(), false);
        assert_eq!(result.unwrap_err(), ApiStatus::InternalError);
    }
}
