//! Pure state transition function.
//!
//! `transition` takes the member's current status, an event and the policy,
//! and returns the next status plus the effects to execute. It performs no
//! I/O, reads no clock and uses no randomness.
//!
//! Events that behave the same in every status (departures, bot joins,
//! duplicate joins) are handled here. The rest is delegated per status:
//! - `just_joined`: members waiting to verify
//! - `kicked`: members removed earlier, possibly joining again
//! - `settled`: `Active` and `Banned`, absorbing for normal traffic

mod just_joined;
mod kicked;
mod settled;

use super::effect::{Effect, LogLevel, Notice};
use super::event::Event;
use super::state::{MemberStatus, MessageRef, Policy};

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub status: MemberStatus,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(status: MemberStatus, effects: Vec<Effect>) -> Self {
        Self { status, effects }
    }

    pub fn no_change(status: MemberStatus) -> Self {
        Self {
            status,
            effects: vec![],
        }
    }
}

/// Given the current status and an event, returns the next status and effects.
pub fn transition(status: MemberStatus, event: Event, policy: &Policy) -> TransitionResult {
    match event {
        Event::Left { notice } => TransitionResult::new(status, departure_effects(notice)),

        Event::Join {
            is_bot: true,
            notice,
            ..
        } => TransitionResult::new(
            status,
            with_notice_deleted(
                notice,
                vec![log(LogLevel::Info, "bot joined, not greeting")],
            ),
        ),

        Event::Join {
            first_arrival: false,
            notice,
            ..
        } => TransitionResult::new(
            status,
            with_notice_deleted(
                notice,
                vec![log(LogLevel::Debug, "join already handled for this arrival")],
            ),
        ),

        event => match status {
            MemberStatus::JustJoined => just_joined::handle(event, policy),
            MemberStatus::Kicked => kicked::handle(event, policy),
            MemberStatus::Active | MemberStatus::Banned => settled::handle(status, event),
        },
    }
}

fn departure_effects(notice: Option<MessageRef>) -> Vec<Effect> {
    with_notice_deleted(
        notice,
        vec![
            Effect::MarkAbsent,
            Effect::ClearPendingMessages { keep_ledger: false },
        ],
    )
}

/// Prepend deletion of the join/leave service message, if there was one.
pub(super) fn with_notice_deleted(notice: Option<MessageRef>, rest: Vec<Effect>) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(rest.len() + 1);
    if let Some(message) = notice {
        effects.push(Effect::DeleteMessage { message });
    }
    effects.extend(rest);
    effects
}

pub(super) fn log(level: LogLevel, message: impl Into<String>) -> Effect {
    Effect::Log {
        level,
        message: message.into(),
    }
}

pub(super) fn notify(notice: Notice) -> Effect {
    Effect::Notify { notice }
}

/// Shared reply for verification and link requests from a member who is not
/// waiting to verify.
pub(super) fn unexpected_status(status: MemberStatus) -> TransitionResult {
    TransitionResult::new(
        status,
        vec![
            log(
                LogLevel::Warn,
                format!("member status is {}, not awaiting verification", status),
            ),
            notify(Notice::UnexpectedStatus { status }),
        ],
    )
}

pub(super) fn not_awaiting_verification(status: MemberStatus) -> TransitionResult {
    TransitionResult::new(
        status,
        vec![
            log(
                LogLevel::Warn,
                format!("admin action on member with status {}", status),
            ),
            notify(Notice::NotAwaitingVerification),
        ],
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    const ALL: [MemberStatus; 4] = [
        MemberStatus::JustJoined,
        MemberStatus::Active,
        MemberStatus::Banned,
        MemberStatus::Kicked,
    ];

    #[test]
    fn test_left_clears_greetings_in_every_status() {
        for status in ALL {
            let result = transition(status, Event::Left { notice: Some(notice()) }, &policy());
            assert_eq!(result.status, status);
            assert_eq!(
                result.effects,
                vec![
                    Effect::DeleteMessage { message: notice() },
                    Effect::MarkAbsent,
                    Effect::ClearPendingMessages { keep_ledger: false },
                ]
            );
        }
    }

    #[test]
    fn test_bot_join_only_deletes_notice() {
        for status in ALL {
            let event = Event::Join {
                is_bot: true,
                first_arrival: true,
                notice: Some(notice()),
            };
            let result = transition(status, event, &policy());
            assert_eq!(result.status, status);
            assert_eq!(
                without_logs(&result.effects),
                vec![Effect::DeleteMessage { message: notice() }]
            );
        }
    }

    #[test]
    fn test_duplicate_join_never_greets() {
        for status in ALL {
            let event = Event::Join {
                is_bot: false,
                first_arrival: false,
                notice: None,
            };
            let result = transition(status, event, &policy());
            assert_eq!(result.status, status);
            assert!(without_logs(&result.effects).is_empty());
        }
    }

    fn arb_status() -> impl Strategy<Value = MemberStatus> {
        prop::sample::select(ALL.to_vec())
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        let message = (any::<i64>(), any::<i64>()).prop_map(|(c, m)| MessageRef::new(c, m));
        prop_oneof![
            (any::<bool>(), any::<bool>(), prop::option::of(message.clone())).prop_map(
                |(is_bot, first_arrival, notice)| Event::Join {
                    is_bot,
                    first_arrival,
                    notice,
                }
            ),
            prop::option::of(message.clone()).prop_map(|notice| Event::Left { notice }),
            message.clone().prop_map(|message| Event::Message { message }),
            "[a-z0-9]{1,16}".prop_map(|code| Event::VerificationCallback { code }),
            any::<i64>().prop_map(|provider_id| Event::VerificationSucceeded { provider_id }),
            ".{0,16}".prop_map(|error| Event::VerificationFailed { error }),
            Just(Event::LinkRequested),
            Just(Event::AdminAccept),
            Just(Event::AdminKick),
            (message, 0i64..2_000_000_000, 0i64..2_000_000_000).prop_map(
                |(message, created, now)| Event::DeadlineExpired {
                    message,
                    created_at: at(created),
                    now: at(now),
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn prop_transition_is_deterministic(status in arb_status(), event in arb_event()) {
            let first = transition(status, event.clone(), &policy());
            let second = transition(status, event, &policy());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_just_joined_message_is_deleted(chat_id in any::<i64>(), message_id in any::<i64>()) {
            let message = MessageRef::new(chat_id, message_id);
            let result = transition(MemberStatus::JustJoined, Event::Message { message }, &policy());
            prop_assert_eq!(result.status, MemberStatus::JustJoined);
            prop_assert_eq!(without_logs(&result.effects), vec![Effect::DeleteMessage { message }]);
        }

        #[test]
        fn prop_active_and_banned_never_change_on_traffic(
            status in prop::sample::select(vec![MemberStatus::Active, MemberStatus::Banned]),
            event in arb_event(),
        ) {
            prop_assume!(!matches!(event, Event::AdminAccept | Event::AdminKick));
            let result = transition(status, event, &policy());
            prop_assert_eq!(result.status, status);
        }
    }
}
