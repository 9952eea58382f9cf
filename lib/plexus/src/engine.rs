use crate::logging::{debug, error, Logger};
use crate::manager::ManagerInner;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

// Traverses states upon internal and external events. Users declare states
// and a transition table per machine; events are the stimulus to move from
// one state to another. An undeclared transition fails the machine. All
// stateful information lives in the operation context; states themselves are
// pure, so enter/exit hooks are plain functions keyed by the state variant.
//
// Internal events are queued on the context by enter hooks and drained in
// the same pass, which yields synchronous chaining (`Always` etc.).

/// Outcome of a state hook or an event dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventResult {
    Success,
    NotSupported,
}

/// The event vocabulary shared by every operation state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ApiEvent {
    Failed,
    Always,
    Satisfied,
    NeedsRecv,
    Cancelled,
    ReceiveRequest,
    Accept,
    ListenAccepted,
    ChannelActivated,
    LinkEstablished,
    LinkDestroyed,
    ConnectionEstablished,
    ConnectionDestroyed,
    ReceivePackage,
    PackageSent,
    PackageReceived,
    PackageFailed,
    StateMachineFailed,
    StateMachineFinished,
    AddDependent,
    DetachDependent,
    ConnSmConnected,
    Read,
    Write,
    Close,
}

/// Declared transitions of one machine: `(from, event) → {to}`. An event may
/// name several target states; the machine disambiguates through
/// [`Machine::choose`].
pub struct TransitionTable<S: Copy + Eq + Hash> {
    transitions: HashMap<(S, ApiEvent), Vec<S>>,
}

impl<S: Copy + Eq + Hash + Debug> TransitionTable<S> {
    #[inline]
    pub fn new() -> TransitionTable<S> {
        TransitionTable {
            transitions: HashMap::new(),
        }
    }

    #[inline]
    pub fn declare(mut self, from: S, event: ApiEvent, to: S) -> TransitionTable<S> {
        let targets = self.transitions.entry((from, event)).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        self
    }

    #[inline]
    pub fn targets(&self, from: S, event: ApiEvent) -> Option<&[S]> {
        self.transitions
            .get(&(from, event))
            .map(|targets| targets.as_slice())
    }

    /// Checks the declarations for the problems a machine author can get
    /// wrong: a non-final state with no way out, a transition into an
    /// undeclared state, or a state nothing can reach. Returns the list of
    /// violations.
    pub fn validate(&self, initial: S, failed: S, states: &[(S, bool)]) -> Vec<String> {
        let mut problems = Vec::new();
        let declared: HashSet<S> = states.iter().map(|(state, _)| *state).collect();
        let mut reached: HashSet<S> = HashSet::new();

        for ((from, event), targets) in self.transitions.iter() {
            if *from == failed {
                problems.push(format!("failed state {:?} declares transitions", from));
            }
            if !declared.contains(from) {
                problems.push(format!("transition from undeclared state {:?}", from));
            }
            if targets.is_empty() {
                problems.push(format!("event {:?} on {:?} has no targets", event, from));
            }
            for to in targets {
                if !declared.contains(to) {
                    problems.push(format!("transition into undeclared state {:?}", to));
                }
                reached.insert(*to);
            }
        }

        for (state, is_final) in states {
            let has_exit = self
                .transitions
                .keys()
                .any(|(from, _)| from == state);
            if !is_final && *state != failed && !has_exit {
                problems.push(format!("non-final state {:?} has no outbound transition", state));
            }
            if *state != initial && *state != failed && !reached.contains(state) {
                problems.push(format!("state {:?} is unreachable", state));
            }
        }

        problems
    }
}

/// One operation state machine: its state enum, transition table and hooks.
/// Hooks receive the manager and the operation context; the context is
/// detached from the arena while the machine runs, so hooks reach other
/// contexts only through posted events.
pub trait Machine {
    type State: Copy + Eq + Hash + Debug + Send + 'static;
    type Ctx;

    const NAME: &'static str;

    fn table() -> &'static TransitionTable<Self::State>;
    fn initial() -> Self::State;
    fn failed() -> Self::State;
    fn is_final(state: Self::State) -> bool;

    fn state_of(ctx: &Self::Ctx) -> Self::State;
    fn set_state(ctx: &mut Self::Ctx, state: Self::State);
    fn pending(ctx: &mut Self::Ctx) -> &mut VecDeque<ApiEvent>;

    fn enter(mgr: &mut ManagerInner, ctx: &mut Self::Ctx, state: Self::State) -> EventResult;

    fn exit(_mgr: &mut ManagerInner, _ctx: &mut Self::Ctx, _state: Self::State) -> EventResult {
        EventResult::Success
    }

    fn prerequisites(_mgr: &ManagerInner, _ctx: &Self::Ctx, _state: Self::State) -> bool {
        true
    }

    /// Disambiguates an event with several target states. The default only
    /// resolves deterministic transitions.
    fn choose(
        _mgr: &ManagerInner,
        _ctx: &Self::Ctx,
        _event: ApiEvent,
        targets: &[Self::State],
    ) -> Option<Self::State> {
        match targets.len() {
            1 => Some(targets[0]),
            _ => None,
        }
    }
}

/// Runs the initial state's enter hook and drains any internally queued
/// events.
pub fn start<M: Machine>(mgr: &mut ManagerInner, ctx: &mut M::Ctx, log: &Logger) -> EventResult {
    M::pending(ctx).clear();

    let initial = M::initial();
    if !M::prerequisites(mgr, ctx, initial) {
        fail::<M>(mgr, ctx, log);
        return EventResult::NotSupported;
    }

    let result = M::enter(mgr, ctx, initial);
    if result != EventResult::Success {
        fail::<M>(mgr, ctx, log);
        return result;
    }

    M::set_state(ctx, initial);
    drain::<M>(mgr, ctx, log)
}

/// Queues an external event and drains.
pub fn handle_event<M: Machine>(
    mgr: &mut ManagerInner,
    ctx: &mut M::Ctx,
    event: ApiEvent,
    log: &Logger,
) -> EventResult {
    let current = M::state_of(ctx);

    // A terminal context is merely awaiting removal; late events for it are
    // dropped.
    if M::is_final(current) || current == M::failed() {
        debug!(log, "dropping event for terminal context";
               "context" => "handle_event",
               "machine" => M::NAME,
               "state" => ?current,
               "event" => ?event);
        return EventResult::Success;
    }

    debug!(log, "handling event";
           "context" => "handle_event",
           "machine" => M::NAME,
           "state" => ?current,
           "event" => ?event);

    M::pending(ctx).push_back(event);
    drain::<M>(mgr, ctx, log)
}

/// Forces the machine into its failed state, running the terminal enter
/// hook.
pub fn fail<M: Machine>(mgr: &mut ManagerInner, ctx: &mut M::Ctx, log: &Logger) {
    debug!(log, "machine failed";
           "context" => "fail",
           "machine" => M::NAME,
           "state" => ?M::state_of(ctx));

    M::exit(mgr, ctx, M::state_of(ctx));
    M::enter(mgr, ctx, M::failed());
    M::set_state(ctx, M::failed());
    M::pending(ctx).clear();
}

fn drain<M: Machine>(mgr: &mut ManagerInner, ctx: &mut M::Ctx, log: &Logger) -> EventResult {
    // Success when there is nothing queued.
    let mut result = EventResult::Success;

    while let Some(event) = M::pending(ctx).pop_front() {
        let current = M::state_of(ctx);

        result = match M::table().targets(current, event) {
            Some(targets) => match M::choose(mgr, ctx, event, targets) {
                Some(next) => transition::<M>(mgr, ctx, current, next, log),
                None => {
                    error!(log, "no transition chosen";
                           "context" => "drain",
                           "machine" => M::NAME,
                           "state" => ?current,
                           "event" => ?event);
                    EventResult::NotSupported
                }
            },
            None => {
                error!(log, "state does not handle event";
                       "context" => "drain",
                       "machine" => M::NAME,
                       "state" => ?current,
                       "event" => ?event);
                EventResult::NotSupported
            }
        };

        if result != EventResult::Success {
            fail::<M>(mgr, ctx, log);
            break;
        }
    }

    result
}

fn transition<M: Machine>(
    mgr: &mut ManagerInner,
    ctx: &mut M::Ctx,
    current: M::State,
    next: M::State,
    log: &Logger,
) -> EventResult {
    let result = M::exit(mgr, ctx, current);
    if result != EventResult::Success {
        error!(log, "exit hook rejected transition";
               "context" => "transition", "machine" => M::NAME, "state" => ?current);
        return result;
    }

    if !M::prerequisites(mgr, ctx, next) {
        error!(log, "next state not ready";
               "context" => "transition", "machine" => M::NAME, "state" => ?next);
        return EventResult::NotSupported;
    }

    let result = M::enter(mgr, ctx, next);
    if result == EventResult::Success {
        M::set_state(ctx, next);
    } else {
        error!(log, "failed to enter next state";
               "context" => "transition", "machine" => M::NAME, "state" => ?next);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    enum TestState {
        Init,
        Mid,
        Done,
        Failed,
        Orphan,
    }

    fn table() -> TransitionTable<TestState> {
        TransitionTable::new()
            .declare(TestState::Init, ApiEvent::Always, TestState::Mid)
            .declare(TestState::Mid, ApiEvent::PackageSent, TestState::Done)
    }

    #[test]
    fn test_validate_accepts_complete_machine() {
        let problems = table().validate(
            TestState::Init,
            TestState::Failed,
            &[
                (TestState::Init, false),
                (TestState::Mid, false),
                (TestState::Done, true),
                (TestState::Failed, false),
            ],
        );
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn test_validate_flags_unreachable_and_dead_end() {
        let problems = table().validate(
            TestState::Init,
            TestState::Failed,
            &[
                (TestState::Init, false),
                (TestState::Mid, false),
                (TestState::Done, true),
                (TestState::Failed, false),
                // Not final, nothing leads to it, no way out of it.
                (TestState::Orphan, false),
            ],
        );
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_validate_flags_undeclared_target() {
        let table = table().declare(TestState::Done, ApiEvent::Close, TestState::Orphan);
        let problems = table.validate(
            TestState::Init,
            TestState::Failed,
            &[
                (TestState::Init, false),
                (TestState::Mid, false),
                (TestState::Done, true),
                (TestState::Failed, false),
            ],
        );
        assert!(!problems.is_empty());
    }
}
