use crate::channel_mgr::ActivateChannelStatusCode;
use crate::context::ConnContext;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::logging::{debug, error};
use crate::manager::ManagerInner;
use crate::support::LinkKind;
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// Drives one channel activation, link creation or load, and connection
/// open. Once connected it holds the connection on behalf of its dependents
/// and closes it (destroying the link if it created one) after the last
/// dependent is gone.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnState {
    Initial,
    AwaitingChannel,
    AwaitingLink,
    AwaitingConnection,
    Connected,
    Closing,
    Finished,
    Failed,
}

pub const STATES: &[(ConnState, bool)] = &[
    (ConnState::Initial, false),
    (ConnState::AwaitingChannel, false),
    (ConnState::AwaitingLink, false),
    (ConnState::AwaitingConnection, false),
    (ConnState::Connected, false),
    (ConnState::Closing, false),
    (ConnState::Finished, true),
    (ConnState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<ConnState> = TransitionTable::new()
        .declare(ConnState::Initial, ApiEvent::Always, ConnState::AwaitingChannel)
        .declare(ConnState::AwaitingChannel, ApiEvent::ChannelActivated, ConnState::AwaitingLink)
        .declare(ConnState::AwaitingLink, ApiEvent::LinkEstablished, ConnState::AwaitingConnection)
        .declare(
            ConnState::AwaitingConnection,
            ApiEvent::ConnectionEstablished,
            ConnState::Connected,
        )
        // Dependent bookkeeping while connected. Losing the last dependent
        // starts a graceful close; the parent failing fails this machine
        // with it (no target is chosen, see choose()).
        .declare(ConnState::Connected, ApiEvent::AddDependent, ConnState::Connected)
        .declare(ConnState::Connected, ApiEvent::StateMachineFinished, ConnState::Connected)
        .declare(ConnState::Connected, ApiEvent::StateMachineFinished, ConnState::Closing)
        .declare(ConnState::Connected, ApiEvent::StateMachineFailed, ConnState::Connected)
        .declare(ConnState::Connected, ApiEvent::StateMachineFailed, ConnState::Closing)
        .declare(ConnState::Connected, ApiEvent::DetachDependent, ConnState::Connected)
        .declare(ConnState::Connected, ApiEvent::DetachDependent, ConnState::Closing)
        // Packages multiplexed for other contexts share this connection.
        .declare(ConnState::Connected, ApiEvent::ReceivePackage, ConnState::Connected)
        .declare(ConnState::Closing, ApiEvent::StateMachineFinished, ConnState::Closing)
        .declare(ConnState::Closing, ApiEvent::StateMachineFailed, ConnState::Closing)
        .declare(ConnState::Closing, ApiEvent::DetachDependent, ConnState::Closing)
        .declare(ConnState::Closing, ApiEvent::ReceivePackage, ConnState::Closing)
        .declare(ConnState::Closing, ApiEvent::ConnectionDestroyed, ConnState::Closing)
        .declare(ConnState::Closing, ApiEvent::ConnectionDestroyed, ConnState::Finished)
        .declare(ConnState::Closing, ApiEvent::LinkDestroyed, ConnState::Finished);
}

pub struct ConnMachine;

impl Machine for ConnMachine {
    type State = ConnState;
    type Ctx = ConnContext;

    const NAME: &'static str = "conn";

    #[inline]
    fn table() -> &'static TransitionTable<ConnState> {
        &TABLE
    }

    #[inline]
    fn initial() -> ConnState {
        ConnState::Initial
    }

    #[inline]
    fn failed() -> ConnState {
        ConnState::Failed
    }

    #[inline]
    fn is_final(state: ConnState) -> bool {
        state == ConnState::Finished
    }

    #[inline]
    fn state_of(ctx: &ConnContext) -> ConnState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut ConnContext, state: ConnState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut ConnContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn choose(
        _mgr: &ManagerInner,
        ctx: &ConnContext,
        event: ApiEvent,
        targets: &[ConnState],
    ) -> Option<ConnState> {
        if targets.len() == 1 {
            return Some(targets[0]);
        }

        match (ctx.state, event) {
            // The operation this machine was opened for failing takes the
            // machine down with it. Choosing no target fails the machine.
            (ConnState::Connected, ApiEvent::StateMachineFailed) if ctx.parent_failed => None,
            // Stay connected while anything still relies on the connection.
            // A machine holding a reuse entry lingers even with no
            // dependents left, so later operations against the same address
            // find the connection open; shutdown reaps it.
            (ConnState::Connected, _) => {
                match ctx.dependents.is_empty() && ctx.reuse_key.is_none() {
                    true => Some(ConnState::Closing),
                    _ => Some(ConnState::Connected),
                }
            }
            // Created links are torn down before the machine finishes.
            (ConnState::Closing, ApiEvent::ConnectionDestroyed) => {
                match ctx.creating && !ctx.destroy_issued {
                    true => Some(ConnState::Closing),
                    _ => Some(ConnState::Finished),
                }
            }
            _ => None,
        }
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut ConnContext, state: ConnState) -> EventResult {
        match state {
            ConnState::Initial => enter_initial(mgr, ctx),
            ConnState::AwaitingChannel => EventResult::Success,
            ConnState::AwaitingLink => enter_awaiting_link(mgr, ctx),
            ConnState::AwaitingConnection => enter_awaiting_connection(mgr, ctx),
            ConnState::Connected => enter_connected(mgr, ctx),
            ConnState::Closing => enter_closing(mgr, ctx),
            ConnState::Finished => {
                if let Some(key) = ctx.reuse_key.take() {
                    mgr.remove_reuse(&key);
                }
                mgr.state_machine_finished(ctx.base.handle);
                EventResult::Success
            }
            ConnState::Failed => {
                if let Some(key) = ctx.reuse_key.take() {
                    mgr.remove_reuse(&key);
                }
                mgr.state_machine_failed(ctx.base.handle);
                EventResult::Success
            }
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut ConnContext) -> EventResult {
    if ctx.channel_id.is_empty() {
        error!(mgr.log, "no channel id"; "context" => "conn_initial");
        return EventResult::NotSupported;
    }
    if !ctx.creating && ctx.link_address.is_empty() {
        error!(mgr.log, "loading a link requires an address";
               "context" => "conn_initial", "channel_id" => %ctx.channel_id);
        return EventResult::NotSupported;
    }
    if mgr.plugin(&ctx.channel_id).is_none() {
        error!(mgr.log, "no plugin for channel";
               "context" => "conn_initial", "channel_id" => %ctx.channel_id);
        return EventResult::NotSupported;
    }

    let handle = ctx.base.handle;
    mgr.register_handle(ctx.parent_handle, handle);
    mgr.register_id(&ctx.channel_id, handle);

    let call_handle = mgr.next_handle();
    mgr.register_handle(call_handle, handle);

    let code = mgr.activate_channel(handle, call_handle, &ctx.channel_id, &ctx.role);
    match code {
        ActivateChannelStatusCode::Ok | ActivateChannelStatusCode::AlreadyActivated => {
            ctx.base.pending.push_back(ApiEvent::Always);
            EventResult::Success
        }
        _ => {
            error!(mgr.log, "channel activation rejected";
                   "context" => "conn_initial",
                   "channel_id" => %ctx.channel_id,
                   "code" => ?code);
            EventResult::NotSupported
        }
    }
}

fn enter_awaiting_link(mgr: &mut ManagerInner, ctx: &mut ConnContext) -> EventResult {
    let plugin = match mgr.plugin(&ctx.channel_id) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    let response = match ctx.creating {
        true => plugin.create_link(request, &ctx.channel_id),
        _ => plugin.load_link_address(request, &ctx.channel_id, &ctx.link_address),
    };

    match response.is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "link request rejected";
                   "context" => "conn_awaiting_link",
                   "channel_id" => %ctx.channel_id,
                   "creating" => ctx.creating);
            EventResult::NotSupported
        }
    }
}

fn enter_awaiting_connection(mgr: &mut ManagerInner, ctx: &mut ConnContext) -> EventResult {
    let plugin = match mgr.plugin(&ctx.channel_id) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    let link_id = match &ctx.link_id {
        Some(link_id) => link_id.clone(),
        None => {
            error!(mgr.log, "link established without a link id";
                   "context" => "conn_awaiting_connection");
            return EventResult::NotSupported;
        }
    };

    mgr.register_id(&link_id, ctx.base.handle);

    let request = mgr.next_handle();
    mgr.register_handle(request, ctx.base.handle);

    let kind = match ctx.sending {
        true => LinkKind::Send,
        _ => LinkKind::Recv,
    };

    match plugin.open_connection(request, kind, &link_id, "{}", 0).is_ok() {
        true => EventResult::Success,
        _ => {
            error!(mgr.log, "open connection rejected";
                   "context" => "conn_awaiting_connection", "link_id" => %link_id);
            EventResult::NotSupported
        }
    }
}

fn enter_connected(mgr: &mut ManagerInner, ctx: &mut ConnContext) -> EventResult {
    if ctx.announced {
        return EventResult::Success;
    }
    ctx.announced = true;

    let conn_id = match &ctx.conn_id {
        Some(conn_id) => conn_id.clone(),
        None => {
            error!(mgr.log, "connection established without a connection id";
                   "context" => "conn_connected");
            return EventResult::NotSupported;
        }
    };

    mgr.register_id(&conn_id, ctx.base.handle);

    // Caller-specified addresses are reusable; generated addresses are
    // unique per link, so no reuse is attempted for them.
    if !ctx.creating && !ctx.link_address.is_empty() {
        let key = mgr.record_reuse(&ctx.channel_id, &ctx.link_address, ctx.base.handle, &conn_id);
        ctx.reuse_key = Some(key);
    }

    let advertised = match ctx.creating {
        true => ctx.actual_link_address.clone(),
        _ => ctx.link_address.clone(),
    };

    debug!(mgr.log, "connection ready";
           "context" => "conn_connected",
           "channel_id" => %ctx.channel_id,
           "conn_id" => %conn_id,
           "sending" => ctx.sending);

    mgr.conn_sm_connected(ctx.base.handle, &conn_id, &advertised);
    EventResult::Success
}

fn enter_closing(mgr: &mut ManagerInner, ctx: &mut ConnContext) -> EventResult {
    // A closing connection is no longer offered for reuse.
    if let Some(key) = ctx.reuse_key.take() {
        mgr.remove_reuse(&key);
    }

    if !ctx.close_issued {
        let plugin = match mgr.plugin(&ctx.channel_id) {
            Some(plugin) => plugin,
            None => return EventResult::NotSupported,
        };

        let conn_id = match &ctx.conn_id {
            Some(conn_id) => conn_id.clone(),
            None => return EventResult::NotSupported,
        };

        ctx.close_issued = true;

        let request = mgr.next_handle();
        mgr.register_handle(request, ctx.base.handle);

        if !plugin.close_connection(request, &conn_id).is_ok() {
            error!(mgr.log, "close connection rejected";
                   "context" => "conn_closing", "conn_id" => %conn_id);
            return EventResult::NotSupported;
        }
        return EventResult::Success;
    }

    // Re-entered after the connection went down: destroy a link we created.
    if ctx.conn_destroyed && ctx.creating && !ctx.destroy_issued {
        let plugin = match mgr.plugin(&ctx.channel_id) {
            Some(plugin) => plugin,
            None => return EventResult::NotSupported,
        };

        let link_id = match &ctx.link_id {
            Some(link_id) => link_id.clone(),
            None => return EventResult::NotSupported,
        };

        ctx.destroy_issued = true;

        let request = mgr.next_handle();
        mgr.register_handle(request, ctx.base.handle);

        if !plugin.destroy_link(request, &link_id).is_ok() {
            error!(mgr.log, "destroy link rejected";
                   "context" => "conn_closing", "link_id" => %link_id);
            return EventResult::NotSupported;
        }
    }

    EventResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(ConnState::Initial, ConnState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
