//! Turns raw Telegram updates into engine calls.
//!
//! [`classify`] is pure: it looks at an update and decides what kind of thing
//! happened, so the state machine never inspects optional raw fields.
//! [`Dispatcher`] then applies the per-group gates (bot role, admin list) and
//! calls the engine, rendering its notices back to the user.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use doorman_core::telegram::{
    CallbackQuery, Chat, ChatKind, ChatMember, ChatMemberUpdated, Message, ParseMode, Update,
    User,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::messages::{self, CallbackAction, CallbackDataError};
use crate::platform::Messenger;
use crate::state_machine::repository::{GroupState, IdentityStore};
use crate::state_machine::{Engine, MessageRef, Notice};

/// What an update means, before any state is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Join {
        chat: Chat,
        user: User,
        notice: Option<MessageRef>,
    },
    Left {
        chat: Chat,
        user: User,
        notice: Option<MessageRef>,
    },
    Message {
        chat: Chat,
        user: User,
        message: MessageRef,
    },
    /// A membership change that is neither an arrival nor a departure,
    /// including every change to the bot's own membership.
    MembershipChanged { chat: Chat, member: ChatMember },
    CallbackAction {
        chat: Chat,
        from: User,
        callback_id: String,
        target: Result<(CallbackAction, i64), CallbackDataError>,
    },
    /// Private `/start <group_id>`. `None` if the argument is not a chat id.
    LinkRequested { user: User, group_id: Option<i64> },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoChat,
    UnsupportedChat(ChatKind),
    NoSender,
    NotStartCommand,
    ForeignCallback,
    NothingToHandle,
}

impl Classified {
    fn chat(&self) -> Option<&Chat> {
        match self {
            Self::Join { chat, .. }
            | Self::Left { chat, .. }
            | Self::Message { chat, .. }
            | Self::MembershipChanged { chat, .. }
            | Self::CallbackAction { chat, .. } => Some(chat),
            Self::LinkRequested { .. } | Self::Ignored(_) => None,
        }
    }
}

/// Classify an update. Returns one value per affected user, so a service
/// message announcing several new members yields several `Join`s.
pub fn classify(update: &Update) -> Vec<Classified> {
    let Some(chat) = update.chat() else {
        return vec![Classified::Ignored(IgnoreReason::NoChat)];
    };
    if !matches!(
        chat.kind,
        ChatKind::Private | ChatKind::Group | ChatKind::Supergroup
    ) {
        return vec![Classified::Ignored(IgnoreReason::UnsupportedChat(chat.kind))];
    }

    if let Some(message) = &update.message {
        return classify_message(message);
    }
    if let Some(changed) = &update.my_chat_member {
        return vec![Classified::MembershipChanged {
            chat: changed.chat.clone(),
            member: changed.new_chat_member.clone(),
        }];
    }
    if let Some(changed) = &update.chat_member {
        return vec![classify_member_change(changed)];
    }
    if let Some(query) = &update.callback_query {
        return vec![classify_callback(chat, query)];
    }

    vec![Classified::Ignored(IgnoreReason::NothingToHandle)]
}

fn classify_message(message: &Message) -> Vec<Classified> {
    let chat = &message.chat;
    let notice = Some(MessageRef::new(chat.id, message.message_id));

    if chat.kind == ChatKind::Private {
        let Some(user) = &message.from else {
            return vec![Classified::Ignored(IgnoreReason::NoSender)];
        };
        return vec![classify_private(user, message.text.as_deref().unwrap_or(""))];
    }

    if let Some(members) = message.new_chat_members.as_ref().filter(|m| !m.is_empty()) {
        return members
            .iter()
            .map(|user| Classified::Join {
                chat: chat.clone(),
                user: user.clone(),
                notice,
            })
            .collect();
    }
    if let Some(user) = &message.left_chat_member {
        return vec![Classified::Left {
            chat: chat.clone(),
            user: user.clone(),
            notice,
        }];
    }

    match &message.from {
        Some(user) => vec![Classified::Message {
            chat: chat.clone(),
            user: user.clone(),
            message: MessageRef::new(chat.id, message.message_id),
        }],
        None => vec![Classified::Ignored(IgnoreReason::NoSender)],
    }
}

fn classify_private(user: &User, text: &str) -> Classified {
    let mut tokens = text.split_whitespace();
    let command = tokens.next().unwrap_or("");
    // Clients may append the bot name: `/start@doorman_bot`.
    let is_start = command == "/start" || command.starts_with("/start@");
    match (is_start, tokens.next()) {
        (true, Some(argument)) => Classified::LinkRequested {
            user: user.clone(),
            group_id: argument.parse().ok(),
        },
        _ => Classified::Ignored(IgnoreReason::NotStartCommand),
    }
}

fn classify_member_change(changed: &ChatMemberUpdated) -> Classified {
    let old = &changed.old_chat_member;
    let new = &changed.new_chat_member;
    let chat = changed.chat.clone();

    if old.is_gone() && new.is_present() {
        Classified::Join {
            chat,
            user: new.user.clone(),
            notice: None,
        }
    } else if !old.is_gone() && new.is_gone() {
        Classified::Left {
            chat,
            user: new.user.clone(),
            notice: None,
        }
    } else {
        Classified::MembershipChanged {
            chat,
            member: new.clone(),
        }
    }
}

fn classify_callback(chat: &Chat, query: &CallbackQuery) -> Classified {
    let data = query.data.as_deref().unwrap_or("");
    match messages::parse_callback_data(data) {
        Err(CallbackDataError::UnknownAction) => {
            Classified::Ignored(IgnoreReason::ForeignCallback)
        }
        target => Classified::CallbackAction {
            chat: chat.clone(),
            from: query.from.clone(),
            callback_id: query.id.clone(),
            target,
        },
    }
}

/// Whether the bot can act in this group. Only membership changes pass when
/// the bot is known to lack admin rights, so it can learn when it gets them.
pub fn admits(classified: &Classified, group: &GroupState) -> bool {
    if matches!(classified, Classified::MembershipChanged { .. }) || !group.is_group() {
        return true;
    }
    group.bot_role.map_or(true, |role| role.can_moderate())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminCheckError {
    #[error("no admins synced for chat")]
    NotSynced,

    #[error("admin list is stale (synced {age_secs}s ago)")]
    Stale { age_secs: i64 },

    #[error("user {user_id} is not in the admin list")]
    NotAdmin { user_id: i64 },
}

/// Check `user_id` against the cached admin list of `group`.
pub fn check_admin(
    group: &GroupState,
    user_id: i64,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<(), AdminCheckError> {
    let synced_at = match group.admins_synced_at {
        Some(at) if !group.admin_ids.is_empty() => at,
        _ => return Err(AdminCheckError::NotSynced),
    };

    let age = now.signed_duration_since(synced_at);
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    if age > max_age {
        return Err(AdminCheckError::Stale {
            age_secs: age.num_seconds(),
        });
    }

    if group.admin_ids.contains(&user_id) {
        Ok(())
    } else {
        Err(AdminCheckError::NotAdmin { user_id })
    }
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    store: Arc<dyn IdentityStore>,
    messenger: Arc<dyn Messenger>,
    bot_id: i64,
    admin_max_age: Duration,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, bot_id: i64, admin_max_age: Duration) -> Self {
        let services = engine.services();
        Self {
            store: services.store.clone(),
            messenger: services.messenger.clone(),
            engine,
            bot_id,
            admin_max_age,
        }
    }

    /// Handle every classified item in `update`. Failures are logged per item.
    pub async fn handle_update(&self, update: &Update) {
        for classified in classify(update) {
            if let Err(e) = self.handle(classified).await {
                warn!(update_id = update.update_id, error = %e, "failed to handle update");
            }
        }
    }

    async fn handle(&self, classified: Classified) -> Result<()> {
        if let Classified::Ignored(reason) = classified {
            debug!(?reason, "ignoring update");
            return Ok(());
        }

        let group = match classified.chat() {
            Some(chat) => Some(self.store.get_or_create_group(chat.id, chat.kind).await?),
            None => None,
        };
        if let Some(group) = &group {
            if !admits(&classified, group) {
                debug!(
                    group_id = group.group_id,
                    "bot is not an admin here, dropping update"
                );
                return Ok(());
            }
        }

        match classified {
            Classified::Join { chat, user, notice } => {
                self.engine.handle_join(chat.id, &user, notice).await?;
            }
            Classified::Left { chat, user, notice } => {
                self.engine.handle_left(chat.id, &user, notice).await?;
            }
            Classified::Message {
                chat,
                user,
                message,
            } => {
                self.engine.handle_message(chat.id, &user, message).await?;
            }
            Classified::MembershipChanged { member, .. } => {
                if let Some(group) = group {
                    self.handle_membership_change(group, member).await?;
                }
            }
            Classified::CallbackAction {
                from,
                callback_id,
                target,
                ..
            } => {
                if let Some(group) = group {
                    self.handle_callback(&group, &from, &callback_id, target)
                        .await?;
                }
            }
            Classified::LinkRequested { user, group_id } => {
                self.handle_link_request(&user, group_id).await?;
            }
            Classified::Ignored(_) => {}
        }
        Ok(())
    }

    async fn handle_membership_change(
        &self,
        mut group: GroupState,
        member: ChatMember,
    ) -> Result<()> {
        if member.user.id == self.bot_id {
            info!(
                group_id = group.group_id,
                role = %member.status,
                "bot membership changed"
            );
            group.bot_role = Some(member.status);
        } else if member.status.can_moderate() {
            if !group.admin_ids.contains(&member.user.id) {
                group.admin_ids.push(member.user.id);
            }
        } else {
            group.admin_ids.retain(|id| *id != member.user.id);
        }
        self.store.update_group(&group).await?;
        Ok(())
    }

    async fn handle_callback(
        &self,
        group: &GroupState,
        from: &User,
        callback_id: &str,
        target: Result<(CallbackAction, i64), CallbackDataError>,
    ) -> Result<()> {
        if let Err(e) = check_admin(group, from.id, Utc::now(), self.admin_max_age) {
            warn!(group_id = group.group_id, user_id = from.id, error = %e, "sender is not an admin");
            return self
                .messenger
                .answer_callback(callback_id, &format!("you are not an admin: {}", e))
                .await;
        }

        let (action, target) = match target {
            Ok(parsed) => parsed,
            Err(e) => return self.messenger.answer_callback(callback_id, e.toast()).await,
        };

        info!(
            group_id = group.group_id,
            admin_id = from.id,
            target_id = target,
            %action,
            "handling admin action"
        );
        let toast = match self
            .engine
            .handle_admin_action(group.group_id, target, action)
            .await
        {
            Ok(outcome) => outcome
                .notice()
                .map(Notice::text)
                .unwrap_or_else(|| "Done".to_string()),
            Err(e) if e.is_not_found() => "member not found".to_string(),
            Err(e) => {
                self.messenger
                    .answer_callback(callback_id, "something went wrong")
                    .await?;
                return Err(e.into());
            }
        };
        self.messenger.answer_callback(callback_id, &toast).await
    }

    async fn handle_link_request(&self, user: &User, group_id: Option<i64>) -> Result<()> {
        let Some(group_id) = group_id else {
            warn!(user_id = user.id, "start command with invalid chat id");
            self.messenger
                .send_message(user.id, messages::INVALID_CHAT_ID_TEXT, None, None)
                .await?;
            return Ok(());
        };

        match self.engine.handle_link_request(group_id, user).await {
            Ok(outcome) => {
                if let Some(notice) = outcome.notice() {
                    let parse_mode = match notice {
                        Notice::UnexpectedStatus { .. } => Some(ParseMode::MarkdownV2),
                        _ => None,
                    };
                    self.messenger
                        .send_message(user.id, &notice.text(), None, parse_mode)
                        .await?;
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.messenger
                    .send_message(user.id, messages::NOT_A_MEMBER_TEXT, None, None)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::repository::InMemoryRepository;
    use crate::state_machine::{MemberKey, MemberStatus};
    use crate::testing::{test_services, user, FakeMessenger, FakeProvider};
    use doorman_core::telegram::ChatRole;
    use serde_json::json;

    const GROUP: i64 = -100;
    const BOT: i64 = 999;

    fn update(value: serde_json::Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    fn group_chat() -> serde_json::Value {
        json!({"id": GROUP, "type": "supergroup"})
    }

    fn user_json(id: i64) -> serde_json::Value {
        json!({"id": id, "is_bot": false, "first_name": format!("user{}", id)})
    }

    fn member_json(id: i64, status: &str) -> serde_json::Value {
        json!({"status": status, "user": user_json(id)})
    }

    #[test]
    fn test_new_members_yield_one_join_each() {
        let classified = classify(&update(json!({
            "update_id": 1,
            "message": {
                "message_id": 5,
                "chat": group_chat(),
                "from": user_json(1),
                "new_chat_members": [user_json(2), user_json(3)]
            }
        })));

        assert_eq!(classified.len(), 2);
        for (item, expected) in classified.iter().zip([2, 3]) {
            match item {
                Classified::Join { user, notice, .. } => {
                    assert_eq!(user.id, expected);
                    assert_eq!(*notice, Some(MessageRef::new(GROUP, 5)));
                }
                other => panic!("expected join, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_left_member_service_message() {
        let classified = classify(&update(json!({
            "update_id": 1,
            "message": {
                "message_id": 8,
                "chat": group_chat(),
                "from": user_json(2),
                "left_chat_member": user_json(2)
            }
        })));
        assert!(matches!(
            classified.as_slice(),
            [Classified::Left { user, notice: Some(_), .. }] if user.id == 2
        ));
    }

    #[test]
    fn test_chat_member_transitions() {
        let change = |old: &str, new: &str| {
            classify(&update(json!({
                "update_id": 1,
                "chat_member": {
                    "chat": group_chat(),
                    "from": user_json(1),
                    "old_chat_member": member_json(2, old),
                    "new_chat_member": member_json(2, new)
                }
            })))
            .remove(0)
        };

        assert!(matches!(change("left", "member"), Classified::Join { .. }));
        assert!(matches!(change("kicked", "member"), Classified::Join { .. }));
        assert!(matches!(change("member", "left"), Classified::Left { .. }));
        assert!(matches!(change("member", "kicked"), Classified::Left { .. }));
        assert!(matches!(
            change("member", "administrator"),
            Classified::MembershipChanged { .. }
        ));
    }

    #[test]
    fn test_private_start_command() {
        let start = |text: &str| {
            classify(&update(json!({
                "update_id": 1,
                "message": {
                    "message_id": 1,
                    "chat": {"id": 42, "type": "private"},
                    "from": user_json(42),
                    "text": text
                }
            })))
            .remove(0)
        };

        assert!(matches!(
            start("/start -100"),
            Classified::LinkRequested { group_id: Some(-100), .. }
        ));
        assert!(matches!(
            start("/start nope"),
            Classified::LinkRequested { group_id: None, .. }
        ));
        assert_eq!(
            start("/start"),
            Classified::Ignored(IgnoreReason::NotStartCommand)
        );
        assert_eq!(
            start("hello"),
            Classified::Ignored(IgnoreReason::NotStartCommand)
        );
    }

    #[test]
    fn test_channel_updates_are_ignored() {
        let classified = classify(&update(json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": {"id": -5, "type": "channel"},
                "text": "news"
            }
        })));
        assert_eq!(
            classified,
            vec![Classified::Ignored(IgnoreReason::UnsupportedChat(
                ChatKind::Channel
            ))]
        );
    }

    #[test]
    fn test_callback_classification() {
        let callback = |data: &str| {
            classify(&update(json!({
                "update_id": 1,
                "callback_query": {
                    "id": "cb",
                    "from": user_json(1),
                    "message": {"message_id": 3, "chat": group_chat()},
                    "data": data
                }
            })))
            .remove(0)
        };

        assert!(matches!(
            callback("\u{c}new_member_accept|42"),
            Classified::CallbackAction { target: Ok((CallbackAction::Accept, 42)), .. }
        ));
        assert!(matches!(
            callback("\u{c}new_member_kick|x"),
            Classified::CallbackAction { target: Err(CallbackDataError::BadUserId), .. }
        ));
        assert_eq!(
            callback("something"),
            Classified::Ignored(IgnoreReason::ForeignCallback)
        );
    }

    fn synced_group(admins: Vec<i64>, synced_at: DateTime<Utc>) -> GroupState {
        GroupState {
            admin_ids: admins,
            admins_synced_at: Some(synced_at),
            bot_role: Some(ChatRole::Administrator),
            ..GroupState::new(GROUP, ChatKind::Supergroup)
        }
    }

    #[test]
    fn test_check_admin() {
        let now = Utc::now();
        let max_age = Duration::from_secs(900);
        let group = synced_group(vec![1, 2], now);

        assert_eq!(check_admin(&group, 1, now, max_age), Ok(()));
        assert_eq!(
            check_admin(&group, 3, now, max_age),
            Err(AdminCheckError::NotAdmin { user_id: 3 })
        );

        let unsynced = GroupState::new(GROUP, ChatKind::Supergroup);
        assert_eq!(
            check_admin(&unsynced, 1, now, max_age),
            Err(AdminCheckError::NotSynced)
        );

        let stale = synced_group(vec![1], now - chrono::Duration::seconds(901));
        assert!(matches!(
            check_admin(&stale, 1, now, max_age),
            Err(AdminCheckError::Stale { .. })
        ));
    }

    #[test]
    fn test_gate_drops_updates_where_bot_is_not_admin() {
        let mut group = GroupState::new(GROUP, ChatKind::Supergroup);
        let message = Classified::Message {
            chat: Chat {
                id: GROUP,
                kind: ChatKind::Supergroup,
            },
            user: user(1, "a"),
            message: MessageRef::new(GROUP, 1),
        };

        // Unknown role: assume we can act until told otherwise.
        assert!(admits(&message, &group));
        group.bot_role = Some(ChatRole::Member);
        assert!(!admits(&message, &group));
        group.bot_role = Some(ChatRole::Administrator);
        assert!(admits(&message, &group));
    }

    struct Harness {
        dispatcher: Dispatcher,
        repo: Arc<InMemoryRepository>,
        messenger: Arc<FakeMessenger>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let messenger = Arc::new(FakeMessenger::default());
        let services = test_services(
            repo.clone(),
            messenger.clone(),
            Some(FakeProvider::succeeding(1)),
        );
        let engine = Arc::new(Engine::new(services));
        Harness {
            dispatcher: Dispatcher::new(engine, BOT, Duration::from_secs(900)),
            repo,
            messenger,
        }
    }

    fn join_update(id: i64) -> Update {
        update(json!({
            "update_id": 1,
            "message": {
                "message_id": 5,
                "chat": group_chat(),
                "from": user_json(id),
                "new_chat_members": [user_json(id)]
            }
        }))
    }

    fn callback_update(from: i64, data: &str) -> Update {
        update(json!({
            "update_id": 2,
            "callback_query": {
                "id": "cb",
                "from": user_json(from),
                "message": {"message_id": 1000, "chat": group_chat()},
                "data": data
            }
        }))
    }

    #[tokio::test]
    async fn test_non_admin_callback_gets_toast_and_no_change() {
        let h = harness();
        h.dispatcher.handle_update(&join_update(42)).await;
        h.repo
            .update_group(&synced_group(vec![1], Utc::now()))
            .await
            .unwrap();

        h.dispatcher
            .handle_update(&callback_update(7, &CallbackAction::Accept.data(42)))
            .await;

        let answers = h.messenger.answers();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].1.starts_with("you are not an admin"));
        let member = h.repo.get_member(MemberKey::new(GROUP, 42)).await.unwrap();
        assert_eq!(member.status, MemberStatus::JustJoined);
    }

    #[tokio::test]
    async fn test_admin_accept_activates_member() {
        let h = harness();
        h.dispatcher.handle_update(&join_update(42)).await;
        h.repo
            .update_group(&synced_group(vec![1], Utc::now()))
            .await
            .unwrap();

        h.dispatcher
            .handle_update(&callback_update(1, &CallbackAction::Accept.data(42)))
            .await;

        assert_eq!(
            h.messenger.answers(),
            vec![("cb".to_string(), Notice::Accepted.text())]
        );
        let member = h.repo.get_member(MemberKey::new(GROUP, 42)).await.unwrap();
        assert_eq!(member.status, MemberStatus::Active);
    }

    #[tokio::test]
    async fn test_bot_membership_change_updates_cached_role() {
        let h = harness();
        h.dispatcher
            .handle_update(&update(json!({
                "update_id": 3,
                "my_chat_member": {
                    "chat": group_chat(),
                    "from": user_json(1),
                    "old_chat_member": member_json(BOT, "member"),
                    "new_chat_member": member_json(BOT, "administrator")
                }
            })))
            .await;

        let group = h
            .repo
            .get_or_create_group(GROUP, ChatKind::Supergroup)
            .await
            .unwrap();
        assert_eq!(group.bot_role, Some(ChatRole::Administrator));
    }

    #[tokio::test]
    async fn test_unknown_user_start_gets_not_a_member_reply() {
        let h = harness();
        h.dispatcher
            .handle_update(&update(json!({
                "update_id": 4,
                "message": {
                    "message_id": 1,
                    "chat": {"id": 42, "type": "private"},
                    "from": user_json(42),
                    "text": "/start -100"
                }
            })))
            .await;

        let sent = h.messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 42);
        assert_eq!(sent[0].text, messages::NOT_A_MEMBER_TEXT);
    }
}
