use crate::context::{BootstrapListenContext, BootstrapPreConduitContext, ContextBase};
use crate::encoding::base64;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{frame_envelope, parse_envelope, BootstrapEnvelope};
use crate::logging::{error, info, warn};
use crate::manager::ManagerInner;
use crate::support::{
    ApiStatus, BootstrapOptions, OpHandle, ReceiverCallback, NULL_OP_HANDLE,
};
use crate::PACKAGE_ID_LEN;
use lazy_static::lazy_static;
use std::collections::VecDeque;

// The listener half of the bootstrap handshake. The listen machine stands
// up the initial receive link and publishes its address; every hello that
// arrives becomes a bootstrap pre-conduit, which stands up the remaining
// legs, answers with addresses for the links it created, and hands off to a
// conduit on accept.

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BootstrapListenState {
    Initial,
    Listening,
    Finished,
    Failed,
}

pub const LISTEN_STATES: &[(BootstrapListenState, bool)] = &[
    (BootstrapListenState::Initial, false),
    (BootstrapListenState::Listening, false),
    (BootstrapListenState::Finished, true),
    (BootstrapListenState::Failed, false),
];

lazy_static! {
    static ref LISTEN_TABLE: TransitionTable<BootstrapListenState> = TransitionTable::new()
        .declare(
            BootstrapListenState::Initial,
            ApiEvent::ConnSmConnected,
            BootstrapListenState::Listening,
        )
        .declare(
            BootstrapListenState::Listening,
            ApiEvent::ReceivePackage,
            BootstrapListenState::Listening,
        )
        .declare(
            BootstrapListenState::Listening,
            ApiEvent::Accept,
            BootstrapListenState::Listening,
        )
        .declare(
            BootstrapListenState::Listening,
            ApiEvent::Close,
            BootstrapListenState::Finished,
        );
}

pub fn new_context(
    handle: OpHandle,
    opts: BootstrapOptions,
    callback: ReceiverCallback,
) -> BootstrapListenContext {
    BootstrapListenContext {
        base: ContextBase::new(handle),
        state: BootstrapListenState::Initial,
        api_handle: NULL_OP_HANDLE,
        opts,
        listen_callback: Some(callback),
        accept_callback: None,
        close_callback: None,
        init_recv: Default::default(),
        hello_queue: VecDeque::new(),
        pending_accepts: VecDeque::new(),
    }
}

pub struct BootstrapListenMachine;

impl Machine for BootstrapListenMachine {
    type State = BootstrapListenState;
    type Ctx = BootstrapListenContext;

    const NAME: &'static str = "bootstrap_listen";

    #[inline]
    fn table() -> &'static TransitionTable<BootstrapListenState> {
        &LISTEN_TABLE
    }

    #[inline]
    fn initial() -> BootstrapListenState {
        BootstrapListenState::Initial
    }

    #[inline]
    fn failed() -> BootstrapListenState {
        BootstrapListenState::Failed
    }

    #[inline]
    fn is_final(state: BootstrapListenState) -> bool {
        state == BootstrapListenState::Finished
    }

    #[inline]
    fn state_of(ctx: &BootstrapListenContext) -> BootstrapListenState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut BootstrapListenContext, state: BootstrapListenState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut BootstrapListenContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(
        mgr: &mut ManagerInner,
        ctx: &mut BootstrapListenContext,
        state: BootstrapListenState,
    ) -> EventResult {
        match state {
            BootstrapListenState::Initial => enter_listen_initial(mgr, ctx),
            BootstrapListenState::Listening => enter_listening(mgr, ctx),
            BootstrapListenState::Finished => {
                if let Some(callback) = ctx.accept_callback.take() {
                    callback(ApiStatus::Closing, NULL_OP_HANDLE);
                }
                if let Some(callback) = ctx.close_callback.take() {
                    callback(ApiStatus::Ok);
                }
                mgr.state_machine_finished(ctx.base.handle);
                EventResult::Success
            }
            BootstrapListenState::Failed => {
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

fn enter_listen_initial(mgr: &mut ManagerInner, ctx: &mut BootstrapListenContext) -> EventResult {
    let opts = ctx.opts.clone();

    if opts.init_recv_channel.is_empty() {
        error!(mgr.log, "bootstrap listen requires an initial recv channel";
               "context" => "bootstrap_listen_initial");
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }
    if mgr.plugin(&opts.init_recv_channel).is_none() {
        error!(mgr.log, "failed to get channel";
               "context" => "bootstrap_listen_initial",
               "channel_id" => %opts.init_recv_channel);
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }

    let creating = mgr.creates_links(&opts.init_recv_channel, &opts.init_recv_role, false);
    if !creating && opts.init_recv_address.is_empty() {
        error!(mgr.log, "initial recv address is required";
               "context" => "bootstrap_listen_initial");
        if let Some(callback) = ctx.listen_callback.take() {
            callback(ApiStatus::ChannelInvalid, String::new(), NULL_OP_HANDLE);
        }
        return EventResult::NotSupported;
    }

    ctx.init_recv.created = creating;
    ctx.init_recv.sm_handle = mgr.start_conn_state_machine(
        ctx.base.handle,
        &opts.init_recv_channel,
        &opts.init_recv_role,
        &opts.init_recv_address,
        creating,
        false,
    );
    if ctx.init_recv.sm_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting connection state machine failed";
               "context" => "bootstrap_listen_initial");
        return EventResult::NotSupported;
    }

    mgr.register_handle(ctx.init_recv.sm_handle, ctx.base.handle);
    EventResult::Success
}

fn enter_listening(mgr: &mut ManagerInner, ctx: &mut BootstrapListenContext) -> EventResult {
    if let Some(callback) = ctx.listen_callback.take() {
        let conn_id = match &ctx.init_recv.conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        ctx.api_handle = mgr.next_handle();
        mgr.register_handle(ctx.api_handle, ctx.base.handle);
        mgr.register_id(&conn_id, ctx.base.handle);

        info!(mgr.log, "bootstrap listening";
              "context" => "bootstrap_listen_listening",
              "channel_id" => %ctx.opts.init_recv_channel,
              "conn_id" => %conn_id);

        callback(
            ApiStatus::Ok,
            ctx.init_recv.link_address.clone(),
            ctx.api_handle,
        );
    }

    while let Some(raw) = ctx.hello_queue.pop_front() {
        if raw.len() < PACKAGE_ID_LEN {
            warn!(mgr.log, "undersized hello"; "context" => "bootstrap_listen_listening");
            continue;
        }

        let envelope: BootstrapEnvelope = match parse_envelope(&raw[PACKAGE_ID_LEN..]) {
            Some(envelope) => envelope,
            None => {
                warn!(mgr.log, "malformed hello"; "context" => "bootstrap_listen_listening");
                continue;
            }
        };

        let package_id = match envelope.package_id() {
            Some(package_id) => package_id,
            None => {
                warn!(mgr.log, "hello without package id";
                      "context" => "bootstrap_listen_listening");
                continue;
            }
        };

        let mut recv_messages = Vec::new();
        if let Some(message) = envelope.message_bytes() {
            if !message.is_empty() {
                recv_messages.push(message);
            }
        }

        let conn_id = match &ctx.init_recv.conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        let pre_handle = mgr.start_bootstrap_pre_conduit_state_machine(
            ctx.base.handle,
            ctx.opts.clone(),
            ctx.init_recv.sm_handle,
            &conn_id,
            package_id,
            &envelope,
            recv_messages,
        );
        if pre_handle == NULL_OP_HANDLE {
            warn!(mgr.log, "bootstrap pre-conduit failed to start";
                  "context" => "bootstrap_listen_listening");
            continue;
        }

        ctx.pending_accepts.push_back(pre_handle);
    }

    if ctx.accept_callback.is_some() && !ctx.pending_accepts.is_empty() {
        let callback = ctx.accept_callback.take().expect("accept callback vanished");
        let pre_handle = ctx.pending_accepts.pop_front().expect("accept queue vanished");
        mgr.listen_accept(pre_handle, callback);
    }

    EventResult::Success
}

// ----------------------------------------------
// Bootstrap pre-conduit
// ----------------------------------------------

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BootstrapPreConduitState {
    Initial,
    Waiting,
    Connecting,
    SendResponse,
    Finished,
    Failed,
}

pub const PRE_CONDUIT_STATES: &[(BootstrapPreConduitState, bool)] = &[
    (BootstrapPreConduitState::Initial, false),
    (BootstrapPreConduitState::Waiting, false),
    (BootstrapPreConduitState::Connecting, false),
    (BootstrapPreConduitState::SendResponse, false),
    (BootstrapPreConduitState::Finished, true),
    (BootstrapPreConduitState::Failed, false),
];

lazy_static! {
    static ref PRE_CONDUIT_TABLE: TransitionTable<BootstrapPreConduitState> =
        TransitionTable::new()
            .declare(
                BootstrapPreConduitState::Initial,
                ApiEvent::Always,
                BootstrapPreConduitState::Waiting,
            )
            .declare(
                BootstrapPreConduitState::Waiting,
                ApiEvent::ReceivePackage,
                BootstrapPreConduitState::Waiting,
            )
            .declare(
                BootstrapPreConduitState::Waiting,
                ApiEvent::ListenAccepted,
                BootstrapPreConduitState::Connecting,
            )
            .declare(
                BootstrapPreConduitState::Connecting,
                ApiEvent::ConnSmConnected,
                BootstrapPreConduitState::Connecting,
            )
            .declare(
                BootstrapPreConduitState::Connecting,
                ApiEvent::ReceivePackage,
                BootstrapPreConduitState::Connecting,
            )
            .declare(
                BootstrapPreConduitState::Connecting,
                ApiEvent::Satisfied,
                BootstrapPreConduitState::SendResponse,
            )
            .declare(
                BootstrapPreConduitState::SendResponse,
                ApiEvent::PackageSent,
                BootstrapPreConduitState::Finished,
            )
            .declare(
                BootstrapPreConduitState::SendResponse,
                ApiEvent::Satisfied,
                BootstrapPreConduitState::Finished,
            )
            .declare(
                BootstrapPreConduitState::SendResponse,
                ApiEvent::ReceivePackage,
                BootstrapPreConduitState::SendResponse,
            );
}

pub struct BootstrapPreConduitMachine;

impl Machine for BootstrapPreConduitMachine {
    type State = BootstrapPreConduitState;
    type Ctx = BootstrapPreConduitContext;

    const NAME: &'static str = "bootstrap_pre_conduit";

    #[inline]
    fn table() -> &'static TransitionTable<BootstrapPreConduitState> {
        &PRE_CONDUIT_TABLE
    }

    #[inline]
    fn initial() -> BootstrapPreConduitState {
        BootstrapPreConduitState::Initial
    }

    #[inline]
    fn failed() -> BootstrapPreConduitState {
        BootstrapPreConduitState::Failed
    }

    #[inline]
    fn is_final(state: BootstrapPreConduitState) -> bool {
        state == BootstrapPreConduitState::Finished
    }

    #[inline]
    fn state_of(ctx: &BootstrapPreConduitContext) -> BootstrapPreConduitState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut BootstrapPreConduitContext, state: BootstrapPreConduitState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut BootstrapPreConduitContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(
        mgr: &mut ManagerInner,
        ctx: &mut BootstrapPreConduitContext,
        state: BootstrapPreConduitState,
    ) -> EventResult {
        match state {
            BootstrapPreConduitState::Initial => {
                let drained = mgr.register_package_id(
                    ctx.package_id,
                    &ctx.init_recv_conn_id.clone(),
                    ctx.base.handle,
                );
                ctx.recv_messages.extend(drained);

                ctx.base.pending.push_back(ApiEvent::Always);
                EventResult::Success
            }
            BootstrapPreConduitState::Waiting => EventResult::Success,
            BootstrapPreConduitState::Connecting => enter_connecting(mgr, ctx),
            BootstrapPreConduitState::SendResponse => enter_send_response(mgr, ctx),
            BootstrapPreConduitState::Finished => enter_pre_conduit_finished(mgr, ctx),
            BootstrapPreConduitState::Failed => {
                if let Some(callback) = ctx.accept_callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_connecting(mgr: &mut ManagerInner, ctx: &mut BootstrapPreConduitContext) -> EventResult {
    // First pass stands the legs up; later passes just re-check progress.
    if ctx.final_send.sm_handle == NULL_OP_HANDLE && ctx.final_recv.sm_handle == NULL_OP_HANDLE {
        let opts = ctx.opts.clone();
        let handle = ctx.base.handle;

        if opts.final_send_channel.is_empty() || opts.final_recv_channel.is_empty() {
            error!(mgr.log, "bootstrap requires both final channels";
                   "context" => "bootstrap_pre_conduit_connecting");
            return EventResult::NotSupported;
        }

        // Our final send leg: load the address the dialer created, or
        // create the link and owe the dialer its address.
        match ctx.hello_final_send_address.clone() {
            Some(address) => {
                ctx.final_send.sm_handle = mgr.start_conn_state_machine(
                    handle,
                    &opts.final_send_channel,
                    &opts.final_send_role,
                    &address,
                    false,
                    true,
                );
            }
            None => {
                ctx.final_send.created = true;
                ctx.response_needed = true;
                ctx.final_send.sm_handle = mgr.start_conn_state_machine(
                    handle,
                    &opts.final_send_channel,
                    &opts.final_send_role,
                    &String::new(),
                    true,
                    true,
                );
            }
        }
        if ctx.final_send.sm_handle == NULL_OP_HANDLE {
            return EventResult::NotSupported;
        }
        mgr.register_handle(ctx.final_send.sm_handle, handle);

        match ctx.hello_final_recv_address.clone() {
            Some(address) => {
                ctx.final_recv.sm_handle = mgr.start_conn_state_machine(
                    handle,
                    &opts.final_recv_channel,
                    &opts.final_recv_role,
                    &address,
                    false,
                    false,
                );
            }
            None => {
                ctx.final_recv.created = true;
                ctx.response_needed = true;
                ctx.final_recv.sm_handle = mgr.start_conn_state_machine(
                    handle,
                    &opts.final_recv_channel,
                    &opts.final_recv_role,
                    &String::new(),
                    true,
                    false,
                );
            }
        }
        if ctx.final_recv.sm_handle == NULL_OP_HANDLE {
            return EventResult::NotSupported;
        }
        mgr.register_handle(ctx.final_recv.sm_handle, handle);

        // The response travels over the initial send leg, loaded from the
        // address the dialer supplied in its hello (or configured here).
        if ctx.response_needed {
            let address = ctx
                .hello_init_send_address
                .clone()
                .unwrap_or_else(|| opts.init_send_address.clone());
            if opts.init_send_channel.is_empty() || address.is_empty() {
                error!(mgr.log, "no initial send leg to answer the dialer on";
                       "context" => "bootstrap_pre_conduit_connecting");
                return EventResult::NotSupported;
            }

            ctx.init_send.sm_handle = mgr.start_conn_state_machine(
                handle,
                &opts.init_send_channel,
                &opts.init_send_role,
                &address,
                false,
                true,
            );
            if ctx.init_send.sm_handle == NULL_OP_HANDLE {
                return EventResult::NotSupported;
            }
            mgr.register_handle(ctx.init_send.sm_handle, handle);
        }
    }

    let outstanding = ctx.final_send.outstanding()
        || ctx.final_recv.outstanding()
        || ctx.init_send.outstanding();
    if !outstanding {
        ctx.base.pending.push_back(ApiEvent::Satisfied);
    }
    EventResult::Success
}

fn enter_send_response(mgr: &mut ManagerInner, ctx: &mut BootstrapPreConduitContext) -> EventResult {
    if !ctx.response_needed {
        ctx.base.pending.push_back(ApiEvent::Satisfied);
        return EventResult::Success;
    }

    let plugin = match mgr.plugin(&ctx.opts.init_send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let send_conn = match &ctx.init_send.conn_id {
        Some(conn_id) => conn_id.clone(),
        None => return EventResult::NotSupported,
    };

    let mut envelope = BootstrapEnvelope {
        package_id: base64::encode(ctx.package_id.as_bytes()),
        message: base64::encode(b""),
        ..Default::default()
    };

    // Recipient-relative naming again: our created send link is the
    // dialer's recv link and vice versa.
    if ctx.final_send.created && !ctx.final_send.link_address.is_empty() {
        envelope.final_recv_link_address = Some(ctx.final_send.link_address.clone());
        envelope.final_recv_channel = Some(ctx.opts.final_send_channel.clone());
    }
    if ctx.final_recv.created && !ctx.final_recv.link_address.is_empty() {
        envelope.final_send_link_address = Some(ctx.final_recv.link_address.clone());
        envelope.final_send_channel = Some(ctx.opts.final_recv_channel.clone());
    }

    // Responses are tagged with the real package id so the dialer's
    // registration catches them.
    let package = frame_envelope(ctx.package_id, &envelope);

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    match plugin.send_package(request, &send_conn, package, 0.0, 0).is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "send package rejected";
                   "context" => "bootstrap_pre_conduit_send_response", "conn_id" => %send_conn);
            EventResult::NotSupported
        }
    }
}

fn enter_pre_conduit_finished(
    mgr: &mut ManagerInner,
    ctx: &mut BootstrapPreConduitContext,
) -> EventResult {
    let (send_conn, recv_conn) = match (&ctx.final_send.conn_id, &ctx.final_recv.conn_id) {
        (Some(send_conn), Some(recv_conn)) => (send_conn.clone(), recv_conn.clone()),
        _ => return EventResult::NotSupported,
    };

    let api_handle = mgr.next_handle();
    let conduit_handle = mgr.start_conduit_state_machine(
        ctx.base.handle,
        ctx.final_recv.sm_handle,
        &recv_conn,
        ctx.final_send.sm_handle,
        &send_conn,
        &ctx.opts.final_send_channel.clone(),
        &ctx.opts.final_recv_channel.clone(),
        ctx.package_id,
        std::mem::take(&mut ctx.recv_messages),
        api_handle,
    );
    if conduit_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting conduit state machine failed";
               "context" => "bootstrap_pre_conduit_finished");
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
    fn test_listen_transition_table_is_sound() {
        let problems = LISTEN_TABLE.validate(
            BootstrapListenState::Initial,
            BootstrapListenState::Failed,
            LISTEN_STATES,
        );
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn test_pre_conduit_transition_table_is_sound() {
        let problems = PRE_CONDUIT_TABLE.validate(
            BootstrapPreConduitState::Initial,
            BootstrapPreConduitState::Failed,
            PRE_CONDUIT_STATES,
        );
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
