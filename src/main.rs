use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use steelchat_embedded::backend;
use steelchat_embedded::client::ChatClient;
use steelchat_embedded::config::{self, Args};
use steelchat_embedded::conversation::{ChatView, Conversation, RenderOp, SubmitOutcome};
use steelchat_embedded::models::HealthReport;
use steelchat_embedded::supervisor::EmbeddedBackend;

// Plain terminal rendering of the conversation
struct TerminalView;

impl ChatView for TerminalView {
    fn render(&self, op: RenderOp) {
        let mut out = std::io::stdout().lock();
        let _ = match op {
            RenderOp::UserTurn(content) => writeln!(out, "\n\nYOU:\n{content}\n"),
            RenderOp::AssistantDelta(delta) => write!(out, "{delta}"),
            RenderOp::AssistantDone => writeln!(out, "\n"),
            RenderOp::Notice(text) => writeln!(out, "\n\n🛠 {text}"),
            RenderOp::Telemetry(t) => {
                tracing::debug!(telemetry = %t);
                Ok(())
            }
            RenderOp::Busy(_) => Ok(()),
        };
        let _ = out.flush();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // parse cli arguments; the environment is read here and nowhere else
    let args = Args::parse();
    let config = args.backend_config(config::env_snapshot());

    let mut backend = EmbeddedBackend::new(config, backend::app_factory(args.models.clone()))
        .context("configuring embedded backend")?;
    backend.start().context("starting embedded backend")?;

    if !backend.wait_ready(args.ready_timeout()) {
        backend.stop();
        anyhow::bail!("backend did not become ready within {}s", args.ready_timeout);
    }

    let client = Arc::new(ChatClient::for_port(backend.port()).context("starting chat client")?);
    if !client.wait_healthy(args.health_timeout()) {
        tracing::warn!("health endpoint never answered; continuing anyway");
    }
    tracing::info!("backend running on {}", backend.base_url());

    let conversation = Conversation::new(client.clone(), Arc::new(TerminalView));
    conversation.set_system(args.system.clone());

    println!("Type a message, or /models, /model <tag>, /attach <path>, /health, /quit");
    let result = chat_loop(&client, &conversation);

    drop(conversation);
    backend.stop();
    result
}

fn chat_loop(client: &ChatClient, conversation: &Conversation) -> Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit" | "/exit", _) => break,
            ("/models", _) => client.models(|models| {
                println!("{}", serde_json::to_string_pretty(&models).unwrap_or_default());
            }),
            ("/model", tag) if !tag.trim().is_empty() => client.set_model(tag.trim(), |result| {
                println!("{result}");
            }),
            ("/health", _) => client.health(|payload| {
                println!("{}", HealthReport::from_value(&payload).summary());
            }),
            ("/attach", path) if !path.trim().is_empty() => {
                if conversation.attach_path(Path::new(path.trim())) {
                    println!("attached {} file(s)", conversation.attachments().len());
                }
            }
            _ => match conversation.submit(line) {
                SubmitOutcome::Started | SubmitOutcome::Empty => {}
                SubmitOutcome::Busy => println!("(still answering; wait for the reply)"),
            },
        }
    }
    Ok(())
}
