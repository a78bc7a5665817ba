//! Effect interpreter that executes effects against the outside world.
//!
//! The interpreter is the boundary between the pure state machine and the
//! impure world of I/O. It takes effects (descriptions of what to do) and
//! executes them, returning result events and user-facing notices.
//!
//! Chat failures (a message that cannot be sent or deleted) are logged and
//! execution continues. Storage failures abort the run and surface to the
//! caller, which decides whether to retry or report an error.

use std::sync::Arc;

use chrono::Utc;
use doorman_core::telegram::ParseMode;
use doorman_core::{OAuthSettings, VerificationState};
use tracing::{debug, error, info, warn};

use super::effect::{Effect, LogLevel, Notice};
use super::event::Event;
use super::repository::{
    IdentityStore, Member, MessageKind, PendingLedger, PendingMessage, RepositoryError,
};
use super::state::{MessageRef, Policy};
use crate::messages;
use crate::platform::{IdentityProvider, Messenger};

/// Long-lived dependencies shared by every state machine run.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn IdentityStore>,
    pub ledger: Arc<dyn PendingLedger>,
    pub messenger: Arc<dyn Messenger>,
    /// Only the API process exchanges codes; the bot runs without a provider.
    pub provider: Option<Arc<dyn IdentityProvider>>,
    pub oauth: OAuthSettings,
    pub policy: Policy,
}

/// Context needed by the interpreter to execute effects for one member.
pub struct InterpreterContext<'a> {
    pub services: &'a Services,
    pub member: &'a Member,
    /// Name used when mentioning the member in a greeting.
    pub display_name: &'a str,
}

/// Result of executing an effect.
#[derive(Debug)]
pub enum EffectResult {
    /// Effect completed, produced result events.
    Ok(Vec<Event>),
    /// Effect failed; logged, execution continues.
    Err(String),
    /// Storage failed; execution stops.
    Fatal(RepositoryError),
}

impl EffectResult {
    pub fn single(event: Event) -> Self {
        Self::Ok(vec![event])
    }

    pub fn none() -> Self {
        Self::Ok(vec![])
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self::Err(msg.into())
    }
}

/// What a run of effects produced.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub events: Vec<Event>,
    pub notices: Vec<Notice>,
}

/// Execute a list of effects and collect result events and notices.
///
/// Effects are executed sequentially. If an effect fails, execution continues
/// with remaining effects and the error is logged, unless it was a storage
/// failure.
pub async fn execute_effects(
    ctx: &InterpreterContext<'_>,
    effects: Vec<Effect>,
) -> Result<ExecutionReport, RepositoryError> {
    let mut report = ExecutionReport::default();

    for effect in effects {
        if let Effect::Notify { notice } = effect {
            report.notices.push(notice);
            continue;
        }

        match execute_effect(ctx, effect).await {
            EffectResult::Ok(events) => report.events.extend(events),
            EffectResult::Err(err) => {
                error!(
                    member_id = %ctx.member.id,
                    group_id = ctx.member.key.group_id,
                    "Effect execution failed: {}",
                    err
                );
            }
            EffectResult::Fatal(err) => return Err(err),
        }
    }

    Ok(report)
}

/// Execute a single effect.
async fn execute_effect(ctx: &InterpreterContext<'_>, effect: Effect) -> EffectResult {
    match effect {
        Effect::DeleteMessage { message } => execute_delete_message(ctx, message).await,

        Effect::SendGreeting {
            login_link,
            admin_buttons,
        } => execute_send_greeting(ctx, login_link, admin_buttons).await,

        Effect::SendLoginLink => execute_send_login_link(ctx).await,

        Effect::RemoveFromGroup => {
            let key = ctx.member.key;
            match ctx
                .services
                .messenger
                .remove_member(key.group_id, key.external_id)
                .await
            {
                Ok(()) => {
                    info!(group_id = key.group_id, external_id = key.external_id, "removed member");
                    EffectResult::none()
                }
                Err(e) => EffectResult::err(format!("removing {} from group: {:#}", key, e)),
            }
        }

        Effect::MarkAbsent => match ctx.services.store.mark_absent(ctx.member.id).await {
            Ok(()) => EffectResult::none(),
            Err(e) => EffectResult::Fatal(e),
        },

        Effect::RecordVerification { provider_id } => {
            match ctx
                .services
                .store
                .record_verification(ctx.member.id, provider_id)
                .await
            {
                Ok(()) => {
                    info!(
                        member_id = %ctx.member.id,
                        provider_id,
                        "recorded verification"
                    );
                    EffectResult::none()
                }
                Err(e) => EffectResult::Fatal(e),
            }
        }

        Effect::ClearPendingMessages { keep_ledger } => {
            execute_clear_pending(ctx, keep_ledger).await
        }

        Effect::ExchangeCode { code } => execute_exchange_code(ctx, &code).await,

        // Collected by `execute_effects` before dispatch.
        Effect::Notify { .. } => EffectResult::none(),

        Effect::Log { level, message } => {
            let member_id = ctx.member.id.to_string();
            let group_id = ctx.member.key.group_id;
            let external_id = ctx.member.key.external_id;
            match level {
                LogLevel::Debug => debug!(%member_id, group_id, external_id, "{}", message),
                LogLevel::Info => info!(%member_id, group_id, external_id, "{}", message),
                LogLevel::Warn => warn!(%member_id, group_id, external_id, "{}", message),
            }
            EffectResult::none()
        }
    }
}

async fn execute_delete_message(ctx: &InterpreterContext<'_>, message: MessageRef) -> EffectResult {
    match ctx.services.messenger.delete_message(message).await {
        Ok(()) => {
            debug!(%message, "deleted message");
            EffectResult::none()
        }
        Err(e) => EffectResult::err(format!("deleting message {}: {:#}", message, e)),
    }
}

async fn execute_send_greeting(
    ctx: &InterpreterContext<'_>,
    login_link: bool,
    admin_buttons: bool,
) -> EffectResult {
    let services = ctx.services;
    let key = ctx.member.key;

    let text = if login_link {
        messages::greeting_text(ctx.display_name, key.external_id, services.policy.join_timeout)
    } else {
        messages::approval_text(ctx.display_name, key.external_id)
    };
    let markup = messages::greeting_markup(
        services.messenger.bot_username(),
        key.group_id,
        key.external_id,
        login_link,
        admin_buttons,
    );

    let message_id = match services
        .messenger
        .send_message(key.group_id, &text, markup.as_ref(), Some(ParseMode::MarkdownV2))
        .await
    {
        Ok(id) => id,
        Err(e) => return EffectResult::err(format!("sending greeting to {}: {:#}", key, e)),
    };

    let pending = PendingMessage {
        group_id: key.group_id,
        message_id,
        kind: MessageKind::Greeting,
        member_id: ctx.member.id,
        created_at: Utc::now(),
    };
    if let Err(e) = services.ledger.add(&pending).await {
        // Without a ledger row nothing would enforce the deadline.
        return EffectResult::Fatal(e);
    }

    info!(
        group_id = key.group_id,
        external_id = key.external_id,
        message_id,
        "sent greeting"
    );
    EffectResult::none()
}

async fn execute_send_login_link(ctx: &InterpreterContext<'_>) -> EffectResult {
    let key = ctx.member.key;
    let state = VerificationState::new(ctx.member.id.to_string(), key.group_id);
    let url = match ctx.services.oauth.authorize_url(&state) {
        Ok(url) => url,
        Err(e) => return EffectResult::err(format!("building authorize URL: {:#}", e)),
    };
    let markup = messages::login_link_markup(url.as_str());

    // A private chat with a user has the user's id as its chat id.
    match ctx
        .services
        .messenger
        .send_message(key.external_id, messages::LOGIN_LINK_TEXT, Some(&markup), None)
        .await
    {
        Ok(_) => {
            info!(external_id = key.external_id, "sent login link");
            EffectResult::none()
        }
        Err(e) => EffectResult::err(format!("sending login link to {}: {:#}", key, e)),
    }
}

async fn execute_clear_pending(ctx: &InterpreterContext<'_>, keep_ledger: bool) -> EffectResult {
    let services = ctx.services;
    let greetings = match services
        .ledger
        .list_for_member(ctx.member.id, ctx.member.key.group_id, MessageKind::Greeting)
        .await
    {
        Ok(greetings) => greetings,
        Err(e) => return EffectResult::Fatal(e),
    };

    for greeting in &greetings {
        let message = greeting.message_ref();
        if let Err(e) = services.messenger.delete_message(message).await {
            warn!(%message, error = %e, "failed to delete greeting");
        }
    }

    if !keep_ledger && !greetings.is_empty() {
        if let Err(e) = services.ledger.delete_batch(&greetings).await {
            return EffectResult::Fatal(e);
        }
    }

    debug!(
        member_id = %ctx.member.id,
        count = greetings.len(),
        keep_ledger,
        "cleared greetings"
    );
    EffectResult::none()
}

async fn execute_exchange_code(ctx: &InterpreterContext<'_>, code: &str) -> EffectResult {
    let Some(provider) = &ctx.services.provider else {
        return EffectResult::single(Event::VerificationFailed {
            error: "no identity provider configured".to_string(),
        });
    };

    match provider.resolve(code).await {
        Ok(provider_id) => EffectResult::single(Event::VerificationSucceeded { provider_id }),
        Err(e) => EffectResult::single(Event::VerificationFailed {
            error: format!("{:#}", e),
        }),
    }
}
