//! Terminal client: streams one turn and renders its channels as they arrive.
//! Channel 0 goes to stderr, dimmed. Channel 1 goes to stdout.

use clap::Parser;
use colored::*;
use std::io::Write;
use thinkwire::budget::ReasoningEffort;
use thinkwire::demux::{consume, DemuxUpdate, TurnEnd};
use thinkwire::transport::{CONVERSATION_ID_HEADER, TURN_ID_HEADER};
use thinkwire::types::{ChatMessage, Role};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a chat turn from a thinkwire relay", long_about = None)]
struct ClientArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,
    #[arg(long, default_value = "default")]
    project: String,
    #[arg(long, value_enum, default_value_t = Effort::Medium)]
    effort: Effort,
    /// Continue an existing conversation.
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    model: Option<String>,
    prompt: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Effort {
    Low,
    Medium,
    High,
    Max,
}

impl From<Effort> for ReasoningEffort {
    fn from(e: Effort) -> Self {
        match e {
            Effort::Low => ReasoningEffort::Low,
            Effort::Medium => ReasoningEffort::Medium,
            Effort::High => ReasoningEffort::High,
            Effort::Max => ReasoningEffort::Max,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thinkwire=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = ClientArgs::parse();
    let url = format!(
        "{}/v1/projects/{}/chat/completions",
        args.server.trim_end_matches('/'),
        args.project
    );
    let body = serde_json::json!({
        "messages": [ChatMessage::new(Role::User, args.prompt.clone())],
        "model": args.model,
        "stream": true,
        "reasoning_effort": ReasoningEffort::from(args.effort),
    });

    let client = reqwest::Client::new();
    let mut request = client.post(&url).json(&body);
    if let Some(cid) = &args.conversation {
        request = request.header(CONVERSATION_ID_HEADER, cid);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} {}", "request failed:".red().bold(), e);
            std::process::exit(1);
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        eprintln!("{} {} {}", "relay refused turn:".red().bold(), status, text);
        std::process::exit(1);
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let conversation_id = header(CONVERSATION_ID_HEADER);
    let turn_id = header(TURN_ID_HEADER);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let demux = consume(Box::pin(response.bytes_stream()), cancel, |update, _| match update {
        DemuxUpdate::Text { channel: 0, text, .. } => {
            let _ = write!(stderr, "{}", text.as_str().dimmed());
            let _ = stderr.flush();
        }
        DemuxUpdate::Text { channel: 1, text, .. } => {
            let _ = write!(stdout, "{}", text);
            let _ = stdout.flush();
        }
        DemuxUpdate::Text { channel, text, .. } => {
            let _ = write!(stderr, "{}", format!("[{}] {}", channel, text).cyan());
            let _ = stderr.flush();
        }
        _ => {}
    })
    .await;
    println!();

    let summary = match demux.end() {
        Some(TurnEnd::Finished { finish_reason }) if finish_reason == "error" => {
            "upstream failed mid-stream".red().to_string()
        }
        Some(TurnEnd::Finished { finish_reason }) => format!("finished ({})", finish_reason).green().to_string(),
        Some(TurnEnd::Sentinel) => "ended without finish".yellow().to_string(),
        Some(TurnEnd::TransportClosed) => "connection closed".yellow().to_string(),
        Some(TurnEnd::Aborted) => "aborted".yellow().to_string(),
        None => "incomplete".yellow().to_string(),
    };
    eprintln!(
        "{} conversation={} turn={} frames={} malformed={}",
        summary,
        conversation_id,
        turn_id,
        demux.frames(),
        demux.malformed_frames()
    );
}
