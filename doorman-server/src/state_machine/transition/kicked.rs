//! Kicked: removed earlier. A new arrival either starts verification over or
//! waits for an admin, depending on the rejoin policy.

use super::{
    log, notify, unexpected_status, with_notice_deleted, Effect, Event, LogLevel, MemberStatus,
    Notice, Policy, TransitionResult,
};
use crate::state_machine::state::RejoinPolicy;

const STATUS: MemberStatus = MemberStatus::Kicked;

pub(super) fn handle(event: Event, policy: &Policy) -> TransitionResult {
    match event {
        Event::Join { notice, .. } => match policy.rejoin {
            RejoinPolicy::Reverify => TransitionResult::new(
                MemberStatus::JustJoined,
                with_notice_deleted(
                    notice,
                    vec![
                        log(LogLevel::Info, "kicked member rejoined, verifying again"),
                        Effect::SendGreeting {
                            login_link: true,
                            admin_buttons: policy.admin_buttons,
                        },
                    ],
                ),
            ),
            RejoinPolicy::AdminApproval => TransitionResult::new(
                STATUS,
                with_notice_deleted(
                    notice,
                    vec![
                        log(
                            LogLevel::Info,
                            "kicked member rejoined, waiting for admin approval",
                        ),
                        Effect::SendGreeting {
                            login_link: false,
                            admin_buttons: true,
                        },
                    ],
                ),
            ),
        },

        Event::Message { message } => TransitionResult::new(
            STATUS,
            vec![
                log(LogLevel::Info, "kicked member posted, removing message"),
                Effect::DeleteMessage { message },
            ],
        ),

        Event::AdminAccept => TransitionResult::new(
            MemberStatus::Active,
            vec![
                log(LogLevel::Info, "admin accepted kicked member"),
                Effect::ClearPendingMessages { keep_ledger: false },
                notify(Notice::Accepted),
            ],
        ),

        Event::AdminKick => TransitionResult::new(
            STATUS,
            vec![
                log(LogLevel::Info, "admin kicked member again"),
                Effect::RemoveFromGroup,
                Effect::MarkAbsent,
                Effect::ClearPendingMessages { keep_ledger: false },
                notify(Notice::Kicked),
            ],
        ),

        Event::DeadlineExpired { message, .. } => TransitionResult::new(
            STATUS,
            vec![Effect::DeleteMessage { message }],
        ),

        Event::VerificationFailed { error } => TransitionResult::new(
            STATUS,
            vec![
                log(LogLevel::Warn, format!("verification failed: {}", error)),
                notify(Notice::VerificationFailed),
            ],
        ),

        Event::VerificationCallback { .. }
        | Event::VerificationSucceeded { .. }
        | Event::LinkRequested => unexpected_status(STATUS),

        Event::Left { .. } => TransitionResult::no_change(STATUS),
    }
}
