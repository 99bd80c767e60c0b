use crate::cancel::TurnRegistry;
use crate::persistence::ConversationStore;
use crate::types::*;
use crate::upstream::UpstreamAdapter;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Streaming chat relay with multiplexed reasoning channels", long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "thinkwire.db")]
    pub database: String,
    /// Base URL of an OpenAI-compatible chat completions API.
    #[arg(long, default_value = "https://openrouter.ai/api/v1")]
    pub upstream_url: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub default_model: String,
    /// Answer tokens added on top of the reasoning budget when the caller sets no max_tokens.
    #[arg(long, default_value_t = 4096)]
    pub default_max_tokens: u32,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 0)]
    pub thinking_channel: u32,
    #[arg(long, default_value_t = 0)]
    pub reasoning_channel: u32,
    #[arg(long, default_value_t = 1)]
    pub content_channel: u32,
    #[arg(long, default_value_t = 50)]
    pub title_max_chars: usize,
    /// Upper bound on deltas coalesced into one frame.
    #[arg(long, default_value_t = 8)]
    pub frame_batch: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Args {
    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap {
            thinking: self.thinking_channel,
            reasoning: self.reasoning_channel,
            content: self.content_channel,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<dyn UpstreamAdapter>,
    pub store: Arc<dyn ConversationStore>,
    pub turns: Arc<TurnRegistry>,
    pub args: Arc<Args>,
    pub health: Arc<UpstreamHealth>,
}

impl AppState {
    pub fn new(
        upstream: Arc<dyn UpstreamAdapter>,
        store: Arc<dyn ConversationStore>,
        args: Arc<Args>,
        health: Arc<UpstreamHealth>,
    ) -> Self {
        Self {
            upstream,
            store,
            turns: TurnRegistry::new(),
            args,
            health,
        }
    }
}
