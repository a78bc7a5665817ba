//! Effects (side effects as data).
//!
//! Effects describe what should happen as a result of a state transition.
//! The interpreter executes them against the store, the ledger, the messenger
//! and the identity provider.

use super::state::{MemberStatus, MessageRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    // =========================================================================
    // Messaging
    // =========================================================================
    /// Delete one message from the group. A message that is already gone counts as deleted.
    DeleteMessage { message: MessageRef },

    /// Post a greeting in the group and record it in the pending-message ledger.
    SendGreeting {
        /// Include the "log in" button. False for admin-approval greetings.
        login_link: bool,
        admin_buttons: bool,
    },

    /// Send the OAuth link to the member's private chat.
    SendLoginLink,

    /// Remove the member from the group while still allowing them to come back.
    RemoveFromGroup,

    // =========================================================================
    // Storage
    // =========================================================================
    /// Forget that the member is in the group, so their next join counts as an arrival.
    MarkAbsent,

    /// Store the provider id and the Active status in one write.
    RecordVerification { provider_id: i64 },

    /// Delete every greeting for this member from the group.
    ClearPendingMessages {
        /// Keep the ledger rows so the reconciliation loop still enforces the deadline.
        keep_ledger: bool,
    },

    // =========================================================================
    // Provider
    // =========================================================================
    /// Exchange an OAuth code for a provider identity.
    /// Produces `VerificationSucceeded` or `VerificationFailed`.
    ExchangeCode { code: String },

    // =========================================================================
    // Feedback
    // =========================================================================
    /// Report an outcome back to whoever triggered the event.
    Notify { notice: Notice },

    Log { level: LogLevel, message: String },
}

/// User-facing outcomes. The caller decides how to render them: an HTTP
/// status, a callback toast, or a private reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Verified,
    VerificationFailed,
    UnexpectedStatus { status: MemberStatus },
    Accepted,
    Kicked,
    NotAwaitingVerification,
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::Verified => "Successfully authorized, you can close this page.".to_string(),
            Notice::VerificationFailed => {
                "Verification failed, please try logging in again.".to_string()
            }
            Notice::UnexpectedStatus { status } => {
                format!("You have an unexpected status `{}`", status)
            }
            Notice::Accepted => "Member accepted".to_string(),
            Notice::Kicked => "Member kicked".to_string(),
            Notice::NotAwaitingVerification => "user status is not just joined".to_string(),
        }
    }
}

/// Log level for logging effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}
