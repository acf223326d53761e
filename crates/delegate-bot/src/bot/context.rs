use std::collections::HashSet;
use std::sync::Arc;

use delegate_core::core::queue::JobQueue;
use delegate_core::output::JobNotifier;

use crate::telegram::{TelegramClient, TelegramSettings};

pub struct BotContext {
    client: TelegramClient,
    queue: JobQueue,
    allowlist_user_ids: HashSet<i64>,
    allowlist_chat_ids: HashSet<i64>,
    notifier: Arc<JobNotifier>,
}

impl BotContext {
    pub fn new(
        client: TelegramClient,
        queue: JobQueue,
        allowlist_user_ids: HashSet<i64>,
        allowlist_chat_ids: HashSet<i64>,
    ) -> Self {
        Self {
            client,
            queue,
            allowlist_user_ids,
            allowlist_chat_ids,
            notifier: Arc::new(JobNotifier::new()),
        }
    }

    /// Shares the hub job events are published to, so live viewers can
    /// subscribe to running jobs.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn from_settings(client: TelegramClient, queue: JobQueue, settings: TelegramSettings) -> Self {
        Self::new(client, queue, settings.allowlist_user_ids, settings.allowlist_chat_ids)
    }

    pub fn client(&self) -> &TelegramClient {
        &self.client
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn allowlist_user_ids(&self) -> &HashSet<i64> {
        &self.allowlist_user_ids
    }

    pub fn allowlist_chat_ids(&self) -> &HashSet<i64> {
        &self.allowlist_chat_ids
    }

    pub fn notifier(&self) -> &Arc<JobNotifier> {
        &self.notifier
    }
}
