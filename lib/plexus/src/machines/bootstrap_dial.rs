use crate::context::{BootstrapDialContext, BootstrapLeg, ContextBase};
use crate::encoding::base64;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::{frame_envelope, parse_envelope, BootstrapEnvelope};
use crate::logging::{debug, error, info};
use crate::manager::ManagerInner;
use crate::support::{
    ApiStatus, BootstrapOptions, HandleCallback, OpHandle, PackageId, NULL_OP_HANDLE,
};
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Bootstrap dial: an initial link pair carries the handshake, a final link
/// pair carries the conduit. Addresses for links the remote side must load
/// travel in the hello; addresses for links the remote side creates come
/// back in its response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BootstrapDialState {
    Initial,
    WaitingForConnections,
    SendHello,
    HelloSent,
    AwaitingResponse,
    RecvResponse,
    WaitingForFinalConnections,
    Finished,
    Failed,
}

pub const STATES: &[(BootstrapDialState, bool)] = &[
    (BootstrapDialState::Initial, false),
    (BootstrapDialState::WaitingForConnections, false),
    (BootstrapDialState::SendHello, false),
    (BootstrapDialState::HelloSent, false),
    (BootstrapDialState::AwaitingResponse, false),
    (BootstrapDialState::RecvResponse, false),
    (BootstrapDialState::WaitingForFinalConnections, false),
    (BootstrapDialState::Finished, true),
    (BootstrapDialState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<BootstrapDialState> = TransitionTable::new()
        .declare(
            BootstrapDialState::Initial,
            ApiEvent::Always,
            BootstrapDialState::WaitingForConnections,
        )
        .declare(
            BootstrapDialState::WaitingForConnections,
            ApiEvent::ConnSmConnected,
            BootstrapDialState::WaitingForConnections,
        )
        .declare(
            BootstrapDialState::WaitingForConnections,
            ApiEvent::Satisfied,
            BootstrapDialState::SendHello,
        )
        .declare(
            BootstrapDialState::SendHello,
            ApiEvent::PackageSent,
            BootstrapDialState::HelloSent,
        )
        .declare(
            BootstrapDialState::HelloSent,
            ApiEvent::NeedsRecv,
            BootstrapDialState::AwaitingResponse,
        )
        .declare(
            BootstrapDialState::HelloSent,
            ApiEvent::Satisfied,
            BootstrapDialState::Finished,
        )
        .declare(
            BootstrapDialState::AwaitingResponse,
            ApiEvent::ReceivePackage,
            BootstrapDialState::RecvResponse,
        )
        .declare(
            BootstrapDialState::RecvResponse,
            ApiEvent::ReceivePackage,
            BootstrapDialState::RecvResponse,
        )
        .declare(
            BootstrapDialState::RecvResponse,
            ApiEvent::Satisfied,
            BootstrapDialState::WaitingForFinalConnections,
        )
        .declare(
            BootstrapDialState::WaitingForFinalConnections,
            ApiEvent::ConnSmConnected,
            BootstrapDialState::WaitingForFinalConnections,
        )
        .declare(
            BootstrapDialState::WaitingForFinalConnections,
            ApiEvent::Satisfied,
            BootstrapDialState::Finished,
        );
}

pub fn new_context(
    handle: OpHandle,
    opts: BootstrapOptions,
    data: Vec<u8>,
    callback: HandleCallback,
) -> BootstrapDialContext {
    BootstrapDialContext {
        base: ContextBase::new(handle),
        state: BootstrapDialState::Initial,
        opts,
        data,
        callback: Some(callback),
        init_send: BootstrapLeg::default(),
        init_recv: BootstrapLeg::default(),
        final_send: BootstrapLeg::default(),
        final_recv: BootstrapLeg::default(),
        package_id: None,
        response_queue: VecDeque::new(),
    }
}

pub struct BootstrapDialMachine;

impl Machine for BootstrapDialMachine {
    type State = BootstrapDialState;
    type Ctx = BootstrapDialContext;

    const NAME: &'static str = "bootstrap_dial";

    #[inline]
    fn table() -> &'static TransitionTable<BootstrapDialState> {
        &TABLE
    }

    #[inline]
    fn initial() -> BootstrapDialState {
        BootstrapDialState::Initial
    }

    #[inline]
    fn failed() -> BootstrapDialState {
        BootstrapDialState::Failed
    }

    #[inline]
    fn is_final(state: BootstrapDialState) -> bool {
        state == BootstrapDialState::Finished
    }

    #[inline]
    fn state_of(ctx: &BootstrapDialContext) -> BootstrapDialState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut BootstrapDialContext, state: BootstrapDialState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut BootstrapDialContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(
        mgr: &mut ManagerInner,
        ctx: &mut BootstrapDialContext,
        state: BootstrapDialState,
    ) -> EventResult {
        match state {
            BootstrapDialState::Initial => enter_initial(mgr, ctx),
            BootstrapDialState::WaitingForConnections => {
                let outstanding = ctx.init_send.outstanding()
                    || ctx.init_recv.outstanding()
                    || ctx.final_send.outstanding()
                    || ctx.final_recv.outstanding();
                if !outstanding {
                    ctx.base.pending.push_back(ApiEvent::Satisfied);
                }
                EventResult::Success
            }
            BootstrapDialState::SendHello => enter_send_hello(mgr, ctx),
            BootstrapDialState::HelloSent => enter_hello_sent(mgr, ctx),
            BootstrapDialState::AwaitingResponse => {
                // Responses buffered before the registration are already
                // queued and must be consumed.
                if !ctx.response_queue.is_empty() {
                    ctx.base.pending.push_back(ApiEvent::ReceivePackage);
                }
                EventResult::Success
            }
            BootstrapDialState::RecvResponse => enter_recv_response(mgr, ctx),
            BootstrapDialState::WaitingForFinalConnections => {
                if !ctx.final_send.outstanding() && !ctx.final_recv.outstanding() {
                    ctx.base.pending.push_back(ApiEvent::Satisfied);
                }
                EventResult::Success
            }
            BootstrapDialState::Finished => enter_finished(mgr, ctx),
            BootstrapDialState::Failed => {
                if let Some(callback) = ctx.callback.take() {
                    callback(ApiStatus::InternalError, NULL_OP_HANDLE);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn fail_with(ctx: &mut BootstrapDialContext, status: ApiStatus) -> EventResult {
    if let Some(callback) = ctx.callback.take() {
        callback(status, NULL_OP_HANDLE);
    }
    EventResult::NotSupported
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut BootstrapDialContext) -> EventResult {
    let opts = ctx.opts.clone();

    if opts.init_send_channel.is_empty()
        || opts.final_send_channel.is_empty()
        || opts.final_recv_channel.is_empty()
    {
        error!(mgr.log, "bootstrap dial requires init-send and both final channels";
               "context" => "bootstrap_dial_initial");
        return fail_with(ctx, ApiStatus::ChannelInvalid);
    }

    for channel in [
        &opts.init_send_channel,
        &opts.final_send_channel,
        &opts.final_recv_channel,
    ]
    .iter()
    {
        if mgr.plugin(channel).is_none() {
            error!(mgr.log, "failed to get channel";
                   "context" => "bootstrap_dial_initial", "channel_id" => %channel);
            return fail_with(ctx, ApiStatus::ChannelInvalid);
        }
    }

    if ctx.package_id.is_none() {
        let package_id = mgr.random_package_id();
        info!(mgr.log, "generated handshake package id";
              "context" => "bootstrap_dial_initial", "package_id" => %package_id);
        ctx.package_id = Some(package_id);
    }

    let handle = ctx.base.handle;

    // Initial dialer-to-listener link: always loaded from an address the
    // listener published out-of-band. Creating it on this side would
    // require another out-of-band exchange.
    if mgr.creates_links(&opts.init_send_channel, &opts.init_send_role, true) {
        error!(mgr.log, "creating the initial send link on the dialer is not supported";
               "context" => "bootstrap_dial_initial",
               "channel_id" => %opts.init_send_channel);
        return fail_with(ctx, ApiStatus::ChannelInvalid);
    }
    if opts.init_send_address.is_empty() {
        error!(mgr.log, "initial send address is required";
               "context" => "bootstrap_dial_initial");
        return fail_with(ctx, ApiStatus::ChannelInvalid);
    }

    info!(mgr.log, "loading initial send link";
          "context" => "bootstrap_dial_initial", "channel_id" => %opts.init_send_channel);
    ctx.init_send.sm_handle = mgr.start_conn_state_machine(
        handle,
        &opts.init_send_channel,
        &opts.init_send_role,
        &opts.init_send_address,
        false,
        true,
    );
    if ctx.init_send.sm_handle == NULL_OP_HANDLE {
        return EventResult::NotSupported;
    }
    mgr.register_handle(ctx.init_send.sm_handle, handle);

    // Initial listener-to-dialer link. An empty channel means the initial
    // send channel is bidirectional and no separate leg exists.
    if !opts.init_recv_channel.is_empty() {
        let creating = mgr.creates_links(&opts.init_recv_channel, &opts.init_recv_role, false);
        if !creating && opts.init_recv_address.is_empty() {
            error!(mgr.log, "initial recv address is required";
                   "context" => "bootstrap_dial_initial");
            return fail_with(ctx, ApiStatus::ChannelInvalid);
        }

        ctx.init_recv.created = creating;
        ctx.init_recv.sm_handle = mgr.start_conn_state_machine(
            handle,
            &opts.init_recv_channel,
            &opts.init_recv_role,
            &opts.init_recv_address,
            creating,
            false,
        );
        if ctx.init_recv.sm_handle == NULL_OP_HANDLE {
            return EventResult::NotSupported;
        }
        mgr.register_handle(ctx.init_recv.sm_handle, handle);
    }

    // Final send link: created here only when this side is the creator;
    // otherwise the listener creates it and responds with the address.
    if mgr.creates_links(&opts.final_send_channel, &opts.final_send_role, true) {
        debug!(mgr.log, "creating final send link";
               "context" => "bootstrap_dial_initial", "channel_id" => %opts.final_send_channel);
        ctx.final_send.created = true;
        ctx.final_send.sm_handle = mgr.start_conn_state_machine(
            handle,
            &opts.final_send_channel,
            &opts.final_send_role,
            &String::new(),
            true,
            true,
        );
        if ctx.final_send.sm_handle == NULL_OP_HANDLE {
            return EventResult::NotSupported;
        }
        mgr.register_handle(ctx.final_send.sm_handle, handle);
    } else {
        debug!(mgr.log, "waiting on peer to provide final send link";
               "context" => "bootstrap_dial_initial");
    }

    if mgr.creates_links(&opts.final_recv_channel, &opts.final_recv_role, false) {
        debug!(mgr.log, "creating final recv link";
               "context" => "bootstrap_dial_initial", "channel_id" => %opts.final_recv_channel);
        ctx.final_recv.created = true;
        ctx.final_recv.sm_handle = mgr.start_conn_state_machine(
            handle,
            &opts.final_recv_channel,
            &opts.final_recv_role,
            &String::new(),
            true,
            false,
        );
        if ctx.final_recv.sm_handle == NULL_OP_HANDLE {
            return EventResult::NotSupported;
        }
        mgr.register_handle(ctx.final_recv.sm_handle, handle);
    } else {
        debug!(mgr.log, "waiting on peer to provide final recv link";
               "context" => "bootstrap_dial_initial");
    }

    ctx.base.pending.push_back(ApiEvent::Always);
    EventResult::Success
}

fn enter_send_hello(mgr: &mut ManagerInner, ctx: &mut BootstrapDialContext) -> EventResult {
    let plugin = match mgr.plugin(&ctx.opts.init_send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let package_id = match ctx.package_id {
        Some(package_id) => package_id,
        None => return EventResult::NotSupported,
    };

    let send_conn = match &ctx.init_send.conn_id {
        Some(conn_id) => conn_id.clone(),
        None => return EventResult::NotSupported,
    };

    // Envelope field names are relative to the recipient: links this side
    // created are links the listener must load.
    let mut envelope = BootstrapEnvelope {
        package_id: base64::encode(package_id.as_bytes()),
        message: base64::encode(&std::mem::take(&mut ctx.data)),
        ..Default::default()
    };

    if ctx.init_recv.created && !ctx.init_recv.link_address.is_empty() {
        envelope.init_send_link_address = Some(ctx.init_recv.link_address.clone());
        envelope.init_send_channel = Some(ctx.opts.init_recv_channel.clone());
    }
    if ctx.final_recv.created && !ctx.final_recv.link_address.is_empty() {
        envelope.final_send_link_address = Some(ctx.final_recv.link_address.clone());
        envelope.final_send_channel = Some(ctx.opts.final_recv_channel.clone());
    }
    if ctx.final_send.created && !ctx.final_send.link_address.is_empty() {
        envelope.final_recv_link_address = Some(ctx.final_send.link_address.clone());
        envelope.final_recv_channel = Some(ctx.opts.final_send_channel.clone());
    }

    let package = frame_envelope(PackageId::zero(), &envelope);

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    match plugin.send_package(request, &send_conn, package, 0.0, 0).is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "send package rejected";
                   "context" => "bootstrap_dial_send_hello", "conn_id" => %send_conn);
            EventResult::NotSupported
        }
    }
}

fn enter_hello_sent(mgr: &mut ManagerInner, ctx: &mut BootstrapDialContext) -> EventResult {
    let final_links_missing = ctx.final_send.conn_id.is_none() || ctx.final_recv.conn_id.is_none();

    if final_links_missing {
        // The listener owes us addresses; listen for its tagged response.
        let package_id = match ctx.package_id {
            Some(package_id) => package_id,
            None => return EventResult::NotSupported,
        };

        let recv_conn = match &ctx.init_recv.conn_id {
            Some(conn_id) => conn_id.clone(),
            None => {
                error!(mgr.log, "no initial recv connection to await the response on";
                       "context" => "bootstrap_dial_hello_sent");
                return EventResult::NotSupported;
            }
        };

        for payload in mgr.register_package_id(package_id, &recv_conn, ctx.base.handle) {
            ctx.response_queue.push_back(payload);
        }

        ctx.base.pending.push_back(ApiEvent::NeedsRecv);
        return EventResult::Success;
    }

    ctx.base.pending.push_back(ApiEvent::Satisfied);
    EventResult::Success
}

fn enter_recv_response(mgr: &mut ManagerInner, ctx: &mut BootstrapDialContext) -> EventResult {
    while let Some(payload) = ctx.response_queue.pop_front() {
        let envelope: BootstrapEnvelope = match parse_envelope(&payload) {
            Some(envelope) => envelope,
            None => {
                error!(mgr.log, "failed to process response";
                       "context" => "bootstrap_dial_recv_response");
                continue;
            }
        };

        if ctx.final_send.conn_id.is_none() && ctx.final_send.sm_handle == NULL_OP_HANDLE {
            let address = match &envelope.final_send_link_address {
                Some(address) => address.clone(),
                None => continue,
            };

            if envelope.final_send_channel.as_ref() != Some(&ctx.opts.final_send_channel) {
                error!(mgr.log, "response names an unexpected final send channel";
                       "context" => "bootstrap_dial_recv_response");
                continue;
            }

            info!(mgr.log, "loading final send link";
                  "context" => "bootstrap_dial_recv_response",
                  "channel_id" => %ctx.opts.final_send_channel);

            ctx.final_send.sm_handle = mgr.start_conn_state_machine(
                ctx.base.handle,
                &ctx.opts.final_send_channel.clone(),
                &ctx.opts.final_send_role.clone(),
                &address,
                false,
                true,
            );
            if ctx.final_send.sm_handle == NULL_OP_HANDLE {
                return EventResult::NotSupported;
            }
            mgr.register_handle(ctx.final_send.sm_handle, ctx.base.handle);
        }

        if ctx.final_recv.conn_id.is_none() && ctx.final_recv.sm_handle == NULL_OP_HANDLE {
            let address = match &envelope.final_recv_link_address {
                Some(address) => address.clone(),
                None => continue,
            };

            if envelope.final_recv_channel.as_ref() != Some(&ctx.opts.final_recv_channel) {
                error!(mgr.log, "response names an unexpected final recv channel";
                       "context" => "bootstrap_dial_recv_response");
                continue;
            }

            ctx.final_recv.sm_handle = mgr.start_conn_state_machine(
                ctx.base.handle,
                &ctx.opts.final_recv_channel.clone(),
                &ctx.opts.final_recv_role.clone(),
                &address,
                false,
                false,
            );
            if ctx.final_recv.sm_handle == NULL_OP_HANDLE {
                return EventResult::NotSupported;
            }
            mgr.register_handle(ctx.final_recv.sm_handle, ctx.base.handle);
        }

        ctx.base.pending.push_back(ApiEvent::Satisfied);
        return EventResult::Success;
    }

    EventResult::Success
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut BootstrapDialContext) -> EventResult {
    let package_id = match ctx.package_id {
        Some(package_id) => package_id,
        None => return EventResult::NotSupported,
    };

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
        package_id,
        Vec::new(),
        api_handle,
    );
    if conduit_handle == NULL_OP_HANDLE {
        error!(mgr.log, "starting conduit state machine failed";
               "context" => "bootstrap_dial_finished");
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
        let problems = TABLE.validate(
            BootstrapDialState::Initial,
            BootstrapDialState::Failed,
            STATES,
        );
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
