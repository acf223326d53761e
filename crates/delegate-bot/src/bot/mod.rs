//! Long polling loop.

pub mod context;

use std::future::Future;
use std::time::Duration;

pub use context::BotContext;

use crate::handlers::handle_message;

pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Polls for updates until `shutdown` resolves, handing each message to
/// [`handle_message`].
pub async fn poll(context: &BotContext, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut offset: Option<i64> = None;

    loop {
        let current_offset = offset;
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutting down telegram polling");
                break;
            }
            updates = context.client().get_updates(current_offset, POLL_TIMEOUT) => {
                let updates = match updates {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!("telegram polling error: {e:#}");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                };

                if !updates.is_empty() {
                    tracing::debug!(count = updates.len(), "received updates");
                }
                for update in updates {
                    offset = Some(update.update_id + 1);
                    if let Some(message) = update.message {
                        handle_message(context, message).await;
                    }
                }
            }
        }
    }
}
