//! Active and Banned: absorbing for normal traffic.

use super::{
    log, not_awaiting_verification, notify, unexpected_status, with_notice_deleted, Effect,
    Event, LogLevel, MemberStatus, Notice, TransitionResult,
};

pub(super) fn handle(status: MemberStatus, event: Event) -> TransitionResult {
    match event {
        Event::Join { notice, .. } => {
            let note = match status {
                MemberStatus::Banned => log(
                    LogLevel::Warn,
                    "banned member joined, not verifying, please investigate",
                ),
                _ => log(LogLevel::Info, "member already verified"),
            };
            TransitionResult::new(status, with_notice_deleted(notice, vec![note]))
        }

        Event::Message { message } => match status {
            MemberStatus::Banned => TransitionResult::new(
                status,
                vec![
                    log(LogLevel::Info, "banned member posted, removing message"),
                    Effect::DeleteMessage { message },
                ],
            ),
            _ => TransitionResult::no_change(status),
        },

        Event::DeadlineExpired { message, .. } => {
            TransitionResult::new(status, vec![Effect::DeleteMessage { message }])
        }

        Event::VerificationFailed { error } => TransitionResult::new(
            status,
            vec![
                log(LogLevel::Warn, format!("verification failed: {}", error)),
                notify(Notice::VerificationFailed),
            ],
        ),

        Event::VerificationCallback { .. }
        | Event::VerificationSucceeded { .. }
        | Event::LinkRequested => unexpected_status(status),

        Event::AdminAccept | Event::AdminKick => not_awaiting_verification(status),

        Event::Left { .. } => TransitionResult::no_change(status),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::transition;
    use super::*;
    use crate::state_machine::state::MessageRef;

    #[test]
    fn test_active_message_is_noop() {
        let message = MessageRef::new(-100, 5);
        let result = transition(MemberStatus::Active, Event::Message { message }, &policy());
        assert_eq!(result, TransitionResult::no_change(MemberStatus::Active));
    }

    #[test]
    fn test_banned_message_is_deleted() {
        let message = MessageRef::new(-100, 5);
        let result = transition(MemberStatus::Banned, Event::Message { message }, &policy());
        assert_eq!(result.status, MemberStatus::Banned);
        assert_eq!(
            without_logs(&result.effects),
            vec![Effect::DeleteMessage { message }]
        );
    }

    #[test]
    fn test_rejoin_of_active_member_only_deletes_notice() {
        let result = transition(MemberStatus::Active, first_join(), &policy());
        assert_eq!(result.status, MemberStatus::Active);
        assert_eq!(
            without_logs(&result.effects),
            vec![Effect::DeleteMessage { message: notice() }]
        );
    }

    #[test]
    fn test_verification_on_active_member_reports_status() {
        let event = Event::VerificationCallback {
            code: "c".to_string(),
        };
        let result = transition(MemberStatus::Active, event, &policy());
        assert_eq!(result.status, MemberStatus::Active);
        assert_eq!(
            without_logs(&result.effects),
            vec![Effect::Notify {
                notice: Notice::UnexpectedStatus {
                    status: MemberStatus::Active
                }
            }]
        );
    }

    #[test]
    fn test_admin_actions_are_refused() {
        for event in [Event::AdminAccept, Event::AdminKick] {
            let result = transition(MemberStatus::Banned, event, &policy());
            assert_eq!(result.status, MemberStatus::Banned);
            assert!(result.effects.contains(&Effect::Notify {
                notice: Notice::NotAwaitingVerification
            }));
        }
    }
}
