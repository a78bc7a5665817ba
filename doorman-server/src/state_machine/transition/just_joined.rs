//! JustJoined: the member is in the group and has not verified yet.

use super::{
    log, notify, with_notice_deleted, Effect, Event, LogLevel, MemberStatus,
    Notice, Policy, TransitionResult,
};
use crate::state_machine::state::deadline_passed;

const STATUS: MemberStatus = MemberStatus::JustJoined;

pub(super) fn handle(event: Event, policy: &Policy) -> TransitionResult {
    match event {
        Event::Join { notice, .. } => TransitionResult::new(
            STATUS,
            with_notice_deleted(
                notice,
                vec![
                    log(LogLevel::Info, "member joined, sending greeting"),
                    Effect::SendGreeting {
                        login_link: true,
                        admin_buttons: policy.admin_buttons,
                    },
                ],
            ),
        ),

        Event::Message { message } => TransitionResult::new(
            STATUS,
            vec![
                log(
                    LogLevel::Info,
                    "member has not verified yet, removing message",
                ),
                Effect::DeleteMessage { message },
            ],
        ),

        Event::VerificationCallback { code } => {
            TransitionResult::new(STATUS, vec![Effect::ExchangeCode { code }])
        }

        Event::VerificationSucceeded { provider_id } => TransitionResult::new(
            MemberStatus::Active,
            vec![
                Effect::RecordVerification { provider_id },
                Effect::ClearPendingMessages { keep_ledger: false },
                notify(Notice::Verified),
            ],
        ),

        Event::VerificationFailed { error } => TransitionResult::new(
            STATUS,
            vec![
                log(LogLevel::Warn, format!("verification failed: {}", error)),
                notify(Notice::VerificationFailed),
            ],
        ),

        Event::LinkRequested => TransitionResult::new(
            STATUS,
            vec![
                Effect::SendLoginLink,
                Effect::ClearPendingMessages { keep_ledger: true },
            ],
        ),

        Event::AdminAccept => TransitionResult::new(
            MemberStatus::Active,
            vec![
                log(LogLevel::Info, "admin accepted member"),
                Effect::ClearPendingMessages { keep_ledger: false },
                notify(Notice::Accepted),
            ],
        ),

        Event::AdminKick => TransitionResult::new(
            MemberStatus::Kicked,
            vec![
                log(LogLevel::Info, "admin kicked member"),
                Effect::RemoveFromGroup,
                Effect::MarkAbsent,
                Effect::ClearPendingMessages { keep_ledger: false },
                notify(Notice::Kicked),
            ],
        ),

        Event::DeadlineExpired {
            message,
            created_at,
            now,
        } => {
            if deadline_passed(created_at, now, policy.join_timeout) {
                TransitionResult::new(
                    MemberStatus::Kicked,
                    vec![
                        log(LogLevel::Info, "removing member by timeout"),
                        Effect::RemoveFromGroup,
                        Effect::MarkAbsent,
                        Effect::DeleteMessage { message },
                    ],
                )
            } else {
                TransitionResult::no_change(STATUS)
            }
        }

        // Departures never reach the per-status handlers.
        Event::Left { .. } => TransitionResult::no_change(STATUS),
    }
}
