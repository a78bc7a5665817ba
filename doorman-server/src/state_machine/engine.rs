//! Drives the state machine for one member at a time.
//!
//! Each entry point resolves the member from storage, turns what happened
//! into an [`Event`], and runs the event loop: transition, execute effects,
//! feed result events back in. The final status is persisted once at the end.

use chrono::{DateTime, Utc};
use doorman_core::telegram::User;
use doorman_core::VerificationState;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::effect::Notice;
use super::event::Event;
use super::interpreter::{execute_effects, InterpreterContext, Services};
use super::repository::{Member, PendingMessage, RepositoryError};
use super::state::{MemberId, MemberKey, MemberStatus, MessageRef};
use super::transition::{transition, TransitionResult};
use crate::messages::CallbackAction;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("verification state does not name a known member")]
    UnknownMember,
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Repository(e) => e.is_not_found(),
            Self::UnknownMember => true,
        }
    }
}

/// Result of processing one inbound event to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub previous: MemberStatus,
    pub status: MemberStatus,
    pub notices: Vec<Notice>,
}

impl Outcome {
    /// The last notice, which is what the caller reports back.
    pub fn notice(&self) -> Option<&Notice> {
        self.notices.last()
    }
}

pub struct Engine {
    services: Services,
}

impl Engine {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Process an event for `member`, including any result events from effects.
    ///
    /// This is the main entry point for handling events. It:
    /// 1. Runs the transition function on the member's current status
    /// 2. Executes effects via the interpreter
    /// 3. Handles result events in order
    /// 4. Stores the final status if it changed
    pub async fn process_event(
        &self,
        member: &Member,
        event: Event,
        display_name: &str,
    ) -> Result<Outcome, EngineError> {
        let ctx = InterpreterContext {
            services: &self.services,
            member,
            display_name,
        };

        let previous = member.status;
        let mut status = previous;
        let mut notices = Vec::new();

        // Event loop: process initial event and any result events from effects
        let mut events_to_process = vec![event];

        while let Some(event) = events_to_process.pop() {
            info!(
                member_id = %member.id,
                group_id = member.key.group_id,
                external_id = member.key.external_id,
                status = %status,
                "Processing event {}",
                event.log_summary()
            );

            let TransitionResult {
                status: next,
                effects,
            } = transition(status, event, &self.services.policy);
            status = next;

            if !effects.is_empty() {
                debug!(member_id = %member.id, "Executing {} effects", effects.len());

                let report = execute_effects(&ctx, effects).await?;
                notices.extend(report.notices);

                // Add result events to be processed (in reverse order so they're processed in order)
                for result_event in report.events.into_iter().rev() {
                    events_to_process.push(result_event);
                }
            }
        }

        if status != previous {
            self.services.store.set_status(member.id, status).await?;
            info!(
                member_id = %member.id,
                group_id = member.key.group_id,
                external_id = member.key.external_id,
                "Member status {} -> {}",
                previous,
                status
            );
        }

        Ok(Outcome {
            previous,
            status,
            notices,
        })
    }

    /// A user appeared in a group.
    ///
    /// Humans are created as `JustJoined` if unknown. Bots are never stored;
    /// for an unknown bot only the join notice is removed.
    pub async fn handle_join(
        &self,
        group_id: i64,
        user: &User,
        notice: Option<MessageRef>,
    ) -> Result<Option<Outcome>, EngineError> {
        let key = MemberKey::new(group_id, user.id);
        let display_name = user.display_name();

        if user.is_bot {
            return match self.services.store.get_member(key).await {
                Ok(member) => {
                    let event = Event::Join {
                        is_bot: true,
                        first_arrival: false,
                        notice,
                    };
                    self.process_event(&member, event, &display_name)
                        .await
                        .map(Some)
                }
                Err(e) if e.is_not_found() => {
                    if let Some(message) = notice {
                        self.delete_best_effort(message).await;
                    }
                    debug!(group_id, external_id = user.id, "ignoring bot join");
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
        }

        let (member, created) = self
            .services
            .store
            .get_or_create_member(key, MemberStatus::JustJoined)
            .await?;
        // A new row is born present, so its creator owns the arrival. For an
        // existing row, whoever flips `present` back on owns it.
        let first_arrival = created || self.services.store.claim_presence(member.id).await?;

        let event = Event::Join {
            is_bot: false,
            first_arrival,
            notice,
        };
        self.process_event(&member, event, &display_name)
            .await
            .map(Some)
    }

    /// A user posted in a group. Unknown posters were there before the bot
    /// and are created as `Active`.
    pub async fn handle_message(
        &self,
        group_id: i64,
        user: &User,
        message: MessageRef,
    ) -> Result<Outcome, EngineError> {
        let key = MemberKey::new(group_id, user.id);
        let (member, _) = self
            .services
            .store
            .get_or_create_member(key, MemberStatus::Active)
            .await?;
        self.process_event(&member, Event::Message { message }, &user.display_name())
            .await
    }

    /// A user left or was removed. Unknown users only get their notice removed.
    pub async fn handle_left(
        &self,
        group_id: i64,
        user: &User,
        notice: Option<MessageRef>,
    ) -> Result<Option<Outcome>, EngineError> {
        let key = MemberKey::new(group_id, user.id);
        match self.services.store.get_member(key).await {
            Ok(member) => self
                .process_event(&member, Event::Left { notice }, &user.display_name())
                .await
                .map(Some),
            Err(e) if e.is_not_found() => {
                if let Some(message) = notice {
                    self.delete_best_effort(message).await;
                }
                debug!(group_id, external_id = user.id, "unknown member left");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// An admin pressed Accept or Kick under a greeting for `target`.
    /// The caller has already checked that the presser is an admin.
    pub async fn handle_admin_action(
        &self,
        group_id: i64,
        target: i64,
        action: CallbackAction,
    ) -> Result<Outcome, EngineError> {
        let member = self
            .services
            .store
            .get_member(MemberKey::new(group_id, target))
            .await?;
        let event = match action {
            CallbackAction::Accept => Event::AdminAccept,
            CallbackAction::Kick => Event::AdminKick,
        };
        self.process_event(&member, event, "").await
    }

    /// The user sent `/start <group_id>` to the bot privately.
    pub async fn handle_link_request(
        &self,
        group_id: i64,
        user: &User,
    ) -> Result<Outcome, EngineError> {
        let member = self
            .services
            .store
            .get_member(MemberKey::new(group_id, user.id))
            .await?;
        self.process_event(&member, Event::LinkRequested, &user.display_name())
            .await
    }

    /// The provider redirected back with `code` for the member named in `state`.
    pub async fn handle_verification(
        &self,
        state: &VerificationState,
        code: String,
    ) -> Result<Outcome, EngineError> {
        let member_id: MemberId = state
            .user_id
            .parse()
            .map_err(|_| EngineError::UnknownMember)?;
        let member = match self.services.store.get_member_by_id(member_id).await {
            Ok(member) => member,
            Err(e) if e.is_not_found() => return Err(EngineError::UnknownMember),
            Err(e) => return Err(e.into()),
        };
        if member.key.group_id != state.chat_id {
            warn!(
                member_id = %member.id,
                state_chat_id = state.chat_id,
                group_id = member.key.group_id,
                "verification state names a different group"
            );
            return Err(EngineError::UnknownMember);
        }

        self.process_event(&member, Event::VerificationCallback { code }, "")
            .await
    }

    /// A greeting in the ledger is old enough to check its deadline.
    ///
    /// Returns `None` when the member no longer exists; the greeting itself is
    /// still removed from the chat.
    pub async fn handle_deadline(
        &self,
        pending: &PendingMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, EngineError> {
        let message = pending.message_ref();
        let member = match self.services.store.get_member_by_id(pending.member_id).await {
            Ok(member) => member,
            Err(e) if e.is_not_found() => {
                warn!(member_id = %pending.member_id, %message, "greeting for unknown member");
                self.delete_best_effort(message).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let event = Event::DeadlineExpired {
            message,
            created_at: pending.created_at,
            now,
        };
        self.process_event(&member, event, "").await.map(Some)
    }

    async fn delete_best_effort(&self, message: MessageRef) {
        if let Err(e) = self.services.messenger.delete_message(message).await {
            warn!(%message, error = %e, "failed to delete message");
        }
    }
}
