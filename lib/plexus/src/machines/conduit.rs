use crate::context::ConduitContext;
use crate::engine::{ApiEvent, EventResult, Machine, TransitionTable};
use crate::frame::frame;
use crate::logging::{debug, error, warn};
use crate::manager::ManagerInner;
use crate::support::ApiStatus;
use lazy_static::lazy_static;
use std::collections::VecDeque;

/// The steady-state bidirectional stream: one send connection, one receive
/// connection, one package id. Reads, writes, package outcomes and inbound
/// packages all loop through the connected state, which settles whatever
/// queues have accumulated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConduitState {
    Initial,
    Connected,
    Finished,
    Failed,
}

pub const STATES: &[(ConduitState, bool)] = &[
    (ConduitState::Initial, false),
    (ConduitState::Connected, false),
    (ConduitState::Finished, true),
    (ConduitState::Failed, false),
];

lazy_static! {
    static ref TABLE: TransitionTable<ConduitState> = TransitionTable::new()
        .declare(ConduitState::Initial, ApiEvent::Always, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::Read, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::Write, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::ReceivePackage, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::PackageSent, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::PackageFailed, ConduitState::Connected)
        .declare(ConduitState::Connected, ApiEvent::Close, ConduitState::Finished);
}

pub struct ConduitMachine;

impl Machine for ConduitMachine {
    type State = ConduitState;
    type Ctx = ConduitContext;

    const NAME: &'static str = "conduit";

    #[inline]
    fn table() -> &'static TransitionTable<ConduitState> {
        &TABLE
    }

    #[inline]
    fn initial() -> ConduitState {
        ConduitState::Initial
    }

    #[inline]
    fn failed() -> ConduitState {
        ConduitState::Failed
    }

    #[inline]
    fn is_final(state: ConduitState) -> bool {
        state == ConduitState::Finished
    }

    #[inline]
    fn state_of(ctx: &ConduitContext) -> ConduitState {
        ctx.state
    }

    #[inline]
    fn set_state(ctx: &mut ConduitContext, state: ConduitState) {
        ctx.state = state;
    }

    #[inline]
    fn pending(ctx: &mut ConduitContext) -> &mut VecDeque<ApiEvent> {
        &mut ctx.base.pending
    }

    fn enter(mgr: &mut ManagerInner, ctx: &mut ConduitContext, state: ConduitState) -> EventResult {
        match state {
            ConduitState::Initial => enter_initial(mgr, ctx),
            ConduitState::Connected => enter_connected(mgr, ctx),
            ConduitState::Finished => enter_finished(mgr, ctx),
            ConduitState::Failed => enter_failed(mgr, ctx),
        }
    }
}

fn enter_initial(mgr: &mut ManagerInner, ctx: &mut ConduitContext) -> EventResult {
    if ctx.send_channel.is_empty() || ctx.recv_channel.is_empty() {
        error!(mgr.log, "conduit requires both channels"; "context" => "conduit_initial");
        return EventResult::NotSupported;
    }

    let handle = ctx.base.handle;
    mgr.register_handle(ctx.api_handle, handle);
    mgr.register_handle(ctx.send_sm_handle, handle);
    mgr.register_handle(ctx.recv_sm_handle, handle);

    let drained = mgr.register_package_id(ctx.package_id, &ctx.recv_conn_id.clone(), handle);
    for payload in drained {
        ctx.recv_queue.push_back(payload);
    }

    debug!(mgr.log, "conduit starting";
           "context" => "conduit_initial",
           "package_id" => %ctx.package_id,
           "send_conn_id" => %ctx.send_conn_id,
           "recv_conn_id" => %ctx.recv_conn_id);

    ctx.base.pending.push_back(ApiEvent::Always);
    EventResult::Success
}

fn enter_connected(mgr: &mut ManagerInner, ctx: &mut ConduitContext) -> EventResult {
    // Settle a pending read against the receive queue.
    if ctx.read_callback.is_some() && !ctx.recv_queue.is_empty() {
        let callback = ctx.read_callback.take().expect("read callback vanished");
        let payload = ctx.recv_queue.pop_front().expect("recv queue vanished");
        callback(ApiStatus::Ok, payload);
    } else if !ctx.recv_queue.is_empty() {
        debug!(mgr.log, "packages queued with no reader";
               "context" => "conduit_connected", "queued" => ctx.recv_queue.len());
    }

    // Hand queued writes to the plugin, tagged with the package id.
    let plugin = match mgr.plugin(&ctx.send_channel) {
        Some(plugin) => plugin,
        None => return EventResult::NotSupported,
    };

    while let Some((callback, bytes)) = ctx.send_queue.pop_front() {
        let request = mgr.next_handle();
        let package = frame(ctx.package_id, &bytes);

        let response = plugin.send_package(request, &ctx.send_conn_id, package, 0.0, 0);
        if response.is_ok() {
            mgr.register_handle(request, ctx.base.handle);
            ctx.sent_map.insert(request, callback);
        } else {
            error!(mgr.log, "send package rejected";
                   "context" => "conduit_connected", "conn_id" => %ctx.send_conn_id);
            callback(ApiStatus::InternalError);
        }
    }

    // Resolve package outcomes that arrived since the last pass.
    for handle in std::mem::take(&mut ctx.sent_list) {
        if let Some(callback) = ctx.sent_map.remove(&handle) {
            callback(ApiStatus::Ok);
        }
    }
    for handle in std::mem::take(&mut ctx.failed_list) {
        if let Some(callback) = ctx.sent_map.remove(&handle) {
            warn!(mgr.log, "package failed";
                  "context" => "conduit_connected", "handle" => handle);
            callback(ApiStatus::InternalError);
        }
    }

    EventResult::Success
}

fn enter_finished(mgr: &mut ManagerInner, ctx: &mut ConduitContext) -> EventResult {
    if let Some(callback) = ctx.read_callback.take() {
        callback(ApiStatus::Closing, Vec::new());
    }

    // Writes that never reached the plugin and writes still awaiting their
    // outcome both fail; late outcomes for them are dropped silently.
    for (callback, _) in ctx.send_queue.drain(..) {
        warn!(mgr.log, "send queue not empty"; "context" => "conduit_finished");
        callback(ApiStatus::InternalError);
    }
    for (_, callback) in ctx.sent_map.drain() {
        warn!(mgr.log, "sent queue not empty"; "context" => "conduit_finished");
        callback(ApiStatus::InternalError);
    }

    mgr.state_machine_finished(ctx.base.handle);

    if let Some(callback) = ctx.close_callback.take() {
        callback(ApiStatus::Ok);
    }
    EventResult::Success
}

fn enter_failed(mgr: &mut ManagerInner, ctx: &mut ConduitContext) -> EventResult {
    for (callback, _) in ctx.send_queue.drain(..) {
        callback(ApiStatus::InternalError);
    }
    for (_, callback) in ctx.sent_map.drain() {
        callback(ApiStatus::InternalError);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_sound() {
        let problems = TABLE.validate(ConduitState::Initial, ConduitState::Failed, STATES);
        assert!(problems.is_empty(), "{:?}", problems);
    }
}
