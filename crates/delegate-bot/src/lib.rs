//! Telegram front end: long polling, allowlists and the demo agents.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use delegate_core::config::Config;
use delegate_core::core::job::{ChatBinding, Job, JobOutcome, JobRunner};
use delegate_core::core::queue::JobQueue;
use delegate_core::core::summarizer::Summarizer;
use delegate_core::output::{
    ChatApi, ChatTarget, ConsoleTarget, JobNotifier, JobStore, JobStoreTarget, NotifierTarget, Output, OutputTarget,
};
use delegate_core::providers::ModelClient;
use delegate_core::providers::anthropic::{AnthropicClient, AnthropicConfig};

use crate::bot::BotContext;
use crate::telegram::{TelegramClient, TelegramSettings};

pub mod agents;
pub mod bot;
pub mod handlers;
pub mod telegram;

/// # Errors
/// Returns an error if no Anthropic API key is configured.
pub fn model_client(config: &Config) -> Result<Arc<dyn ModelClient>> {
    let settings = AnthropicConfig::from_env(&config.providers.anthropic)?;
    Ok(Arc::new(AnthropicClient::new(settings)))
}

fn output(config: &Config, client: &Arc<dyn ModelClient>, targets: Vec<Arc<dyn OutputTarget>>) -> Output {
    let output = Output::new(targets).verbose(config.output.verbose);
    if config.summarizer.enabled {
        let summarizer = Summarizer::new(Arc::clone(client), config.summarizer.model.clone());
        output.with_summarizer(Arc::new(summarizer))
    } else {
        output
    }
}

/// Runs the bot until Ctrl-C.
///
/// # Errors
/// Returns an error if Telegram or the model provider is not configured.
pub async fn run(mut config: Config, verbose: bool) -> Result<()> {
    config.output.verbose |= verbose;
    let settings = TelegramSettings::from_config(&config)?;
    let model = model_client(&config)?;
    let telegram = TelegramClient::new(settings.bot_token.clone());

    let agent = agents::master_agent(&config, Arc::clone(&model), Some(telegram.clone()))?;
    let store = Arc::new(JobStore::new(config.jobs.store_dir()));
    let notifier = Arc::new(JobNotifier::new());
    let chat: Arc<dyn ChatApi> = Arc::new(telegram.clone());
    let targets: Vec<Arc<dyn OutputTarget>> = vec![
        Arc::new(ChatTarget::new(chat, config.output.clone())),
        Arc::new(JobStoreTarget::new(Arc::clone(&store))),
        Arc::new(NotifierTarget::new(Arc::clone(&notifier))),
    ];
    let output = Arc::new(output(&config, &model, targets));
    let queue = JobQueue::new(Arc::new(JobRunner::new(Arc::new(agent), output)));

    tracing::info!(
        model = %config.model,
        users = settings.allowlist_user_ids.len(),
        chats = settings.allowlist_chat_ids.len(),
        jobs_dir = %store.dir().display(),
        "delegate-bot started, polling for updates"
    );
    let context = BotContext::from_settings(telegram, queue, settings).with_notifier(notifier);
    bot::poll(&context, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
        }
    })
    .await;
    Ok(())
}

/// Runs one prompt, printing progress and the answer to stdout.
///
/// # Errors
/// Returns an error if the model provider is not configured.
pub async fn ask(mut config: Config, prompt: &str, verbose: bool) -> Result<JobOutcome> {
    config.output.verbose |= verbose;
    let model = model_client(&config)?;
    let agent = agents::master_agent(&config, Arc::clone(&model), None).context("failed to build agents")?;
    let store = Arc::new(JobStore::new(config.jobs.store_dir()));
    let targets: Vec<Arc<dyn OutputTarget>> = vec![
        Arc::new(ConsoleTarget::stdout(config.output.verbose)),
        Arc::new(JobStoreTarget::new(store)),
    ];
    let output = Arc::new(output(&config, &model, targets));
    let runner = JobRunner::new(Arc::new(agent), output);

    let chat = ChatBinding {
        username: env::var("USER").ok(),
        ..ChatBinding::default()
    };
    Ok(runner.run(&Job::new(chat, prompt)).await)
}
