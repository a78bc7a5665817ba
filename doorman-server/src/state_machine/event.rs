//! Events that trigger state transitions.
//!
//! Events are normalized by the dispatcher (or synthesized by the
//! reconciliation loop and the interpreter) before the transition function
//! sees them. Guard inputs such as "is this the first arrival" or "what time
//! is it" are resolved by the caller and carried here.

use chrono::{DateTime, Utc};

use super::state::MessageRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // =========================================================================
    // Membership
    // =========================================================================
    /// The user appeared in the group.
    Join {
        is_bot: bool,
        /// True for exactly one observer of each arrival (see `claim_presence`).
        first_arrival: bool,
        /// Service message announcing the join, if the update carried one.
        notice: Option<MessageRef>,
    },

    /// The user left or was removed from the group.
    Left { notice: Option<MessageRef> },

    /// The user posted in the group.
    Message { message: MessageRef },

    // =========================================================================
    // Verification
    // =========================================================================
    /// The OAuth provider redirected back with an authorization code.
    VerificationCallback { code: String },

    /// Code exchange succeeded.
    VerificationSucceeded { provider_id: i64 },

    /// Code exchange failed. The member may retry with a fresh code.
    VerificationFailed { error: String },

    /// The user asked the bot privately for their login link.
    LinkRequested,

    // =========================================================================
    // Admin decisions
    // =========================================================================
    AdminAccept,
    AdminKick,

    // =========================================================================
    // Time
    // =========================================================================
    /// A greeting's deadline may have expired.
    DeadlineExpired {
        message: MessageRef,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

impl Event {
    /// Short description for log lines. Never includes the OAuth code.
    pub fn log_summary(&self) -> String {
        match self {
            Event::Join {
                is_bot,
                first_arrival,
                ..
            } => format!("Join(bot={}, first_arrival={})", is_bot, first_arrival),
            Event::Left { .. } => "Left".to_string(),
            Event::Message { message } => format!("Message({})", message),
            Event::VerificationCallback { .. } => "VerificationCallback".to_string(),
            Event::VerificationSucceeded { provider_id } => {
                format!("VerificationSucceeded(provider_id={})", provider_id)
            }
            Event::VerificationFailed { error } => format!("VerificationFailed({})", error),
            Event::LinkRequested => "LinkRequested".to_string(),
            Event::AdminAccept => "AdminAccept".to_string(),
            Event::AdminKick => "AdminKick".to_string(),
            Event::DeadlineExpired { message, .. } => format!("DeadlineExpired({})", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_summary_hides_oauth_code() {
        let event = Event::VerificationCallback {
            code: "super-secret-code".to_string(),
        };
        assert!(!event.log_summary().contains("super-secret-code"));
    }
}
