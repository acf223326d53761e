use std::collections::HashSet;
use std::sync::Arc;

use delegate_core::core::job::{ChatBinding, Job};

use crate::bot::BotContext;
use crate::telegram::Message;

pub const ACCESS_DENIED: &str = "Access denied.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Sender may start jobs.
    Allowed(i64),
    /// Sender is known but not allowlisted.
    Denied(i64),
    Ignored,
}

/// Groups must be allowlisted by chat id; every sender must be allowlisted
/// by user id. Bots and other chat types are ignored.
pub fn check_access(message: &Message, user_ids: &HashSet<i64>, chat_ids: &HashSet<i64>) -> Access {
    let chat_id = message.chat.id;
    if message.chat.is_group() {
        if !chat_ids.contains(&chat_id) {
            tracing::debug!(chat_id, "ignoring non-allowlisted group chat");
            return Access::Ignored;
        }
    } else if !message.chat.is_private() {
        tracing::debug!(chat_id, "ignoring unsupported chat type");
        return Access::Ignored;
    }

    let Some(user) = message.from.as_ref() else {
        return Access::Ignored;
    };
    if user.is_bot {
        return Access::Ignored;
    }
    if user_ids.contains(&user.id) {
        Access::Allowed(user.id)
    } else {
        Access::Denied(user.id)
    }
}

pub fn chat_binding(message: &Message) -> ChatBinding {
    ChatBinding {
        chat_id: message.chat.id,
        thread_id: message.thread_id(),
        message_id: Some(message.message_id),
        user_id: message.from.as_ref().map(|user| user.id),
        username: message
            .from
            .as_ref()
            .and_then(|user| user.display_name())
            .map(str::to_string),
    }
}

/// Turns an allowed text message into a queued job.
///
/// Returns the job when one was enqueued.
pub async fn handle_message(context: &BotContext, message: Message) -> Option<Arc<Job>> {
    let chat_id = message.chat.id;
    match check_access(&message, context.allowlist_user_ids(), context.allowlist_chat_ids()) {
        Access::Allowed(_) => {}
        Access::Denied(user_id) => {
            tracing::warn!(user_id, chat_id, "denied user");
            if let Err(e) = context
                .client()
                .send_message(chat_id, message.thread_id(), ACCESS_DENIED, Some(message.message_id))
                .await
            {
                tracing::debug!(chat_id, "access denied reply failed: {e:#}");
            }
            return None;
        }
        Access::Ignored => return None,
    }

    let Some(text) = message.content() else {
        tracing::debug!(chat_id, "ignoring message without text");
        return None;
    };

    let job = Arc::new(Job::new(chat_binding(&message), text));
    tracing::info!(job_id = %job.id(), chat_id, "job enqueued");
    context.queue().enqueue(Arc::clone(&job));
    Some(job)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(chat: serde_json::Value, from: serde_json::Value) -> Message {
        serde_json::from_value(json!({
            "message_id": 3,
            "chat": chat,
            "from": from,
            "text": "hi"
        }))
        .unwrap()
    }

    fn ids(values: &[i64]) -> HashSet<i64> {
        values.iter().copied().collect()
    }

    #[test]
    fn private_chats_check_the_user() {
        let users = ids(&[42]);
        let chats = HashSet::new();
        let allowed = message(json!({"id": 42, "type": "private"}), json!({"id": 42, "is_bot": false}));
        assert_eq!(check_access(&allowed, &users, &chats), Access::Allowed(42));

        let stranger = message(json!({"id": 7, "type": "private"}), json!({"id": 7, "is_bot": false}));
        assert_eq!(check_access(&stranger, &users, &chats), Access::Denied(7));
    }

    #[test]
    fn groups_need_the_chat_and_the_user() {
        let users = ids(&[42]);
        let group = message(json!({"id": -100, "type": "supergroup"}), json!({"id": 42, "is_bot": false}));
        assert_eq!(check_access(&group, &users, &HashSet::new()), Access::Ignored);
        assert_eq!(check_access(&group, &users, &ids(&[-100])), Access::Allowed(42));

        let other = message(json!({"id": -100, "type": "group"}), json!({"id": 8, "is_bot": false}));
        assert_eq!(check_access(&other, &users, &ids(&[-100])), Access::Denied(8));
    }

    #[test]
    fn bots_and_channels_are_ignored() {
        let users = ids(&[42]);
        let chats = ids(&[-1]);
        let bot = message(json!({"id": 42, "type": "private"}), json!({"id": 42, "is_bot": true}));
        assert_eq!(check_access(&bot, &users, &chats), Access::Ignored);

        let channel = message(json!({"id": -1, "type": "channel"}), json!({"id": 42, "is_bot": false}));
        assert_eq!(check_access(&channel, &users, &chats), Access::Ignored);
    }

    #[test]
    fn binding_carries_reply_target_and_sender() {
        let message: Message = serde_json::from_value(json!({
            "message_id": 9,
            "message_thread_id": 4,
            "is_topic_message": true,
            "chat": {"id": -100, "type": "supergroup"},
            "from": {"id": 42, "is_bot": false, "username": "ada"},
            "text": "go"
        }))
        .unwrap();
        assert_eq!(
            chat_binding(&message),
            ChatBinding {
                chat_id: -100,
                thread_id: Some(4),
                message_id: Some(9),
                user_id: Some(42),
                username: Some("ada".to_string()),
            }
        );
    }
}
