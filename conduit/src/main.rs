#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::io::Write;

use args::{Args, Command};
use clap::Parser;
use conduit_config::GatewayConfig;
use conduit_runtime::{CallOptions, ChatRequest, ErrorKind, Message, ModelRuntime, ProviderRegistry, Runtime, StreamEvent};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(&args.config)?;
    conduit_telemetry::init(&config.log)?;

    tracing::debug!(config_path = %args.config.display(), "configuration loaded");

    let registry = ProviderRegistry::from_config(&config)?;

    // Ctrl-C cancels the in-flight call
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            cancel_clone.cancel();
        }
    });

    match args.command {
        Command::Chat {
            provider,
            prompt,
            model,
            system,
            no_stream,
            json,
            timeout,
        } => {
            let runtime = registry.create_named(&config, &provider)?;

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let mut request = ChatRequest::new(model, messages);
            request.stream = !no_stream;

            let mut options = CallOptions::new().with_cancel(cancel);
            if let Some(timeout) = timeout {
                options = options.with_timeout(timeout);
            }

            chat(&runtime, &request, &options, json).await
        }
        Command::Models { provider } => {
            let runtime = registry.create_named(&config, &provider)?;
            let models = runtime.list_models(&CallOptions::new().with_cancel(cancel)).await?;

            let mut out = std::io::stdout().lock();
            for model in models {
                match model.display_name {
                    Some(name) => writeln!(out, "{}\t{name}", model.id)?,
                    None => writeln!(out, "{}", model.id)?,
                }
            }
            Ok(())
        }
        Command::Providers => {
            let mut out = std::io::stdout().lock();
            for descriptor in registry.descriptors() {
                let protocol = descriptor.protocol.to_string();
                let capabilities: Vec<String> = descriptor.capabilities.offered().map(|c| c.to_string()).collect();
                writeln!(out, "{:<20} {protocol:<10} {}", descriptor.id, capabilities.join(","))?;
            }
            Ok(())
        }
    }
}

/// Run one chat call and print its events
async fn chat(runtime: &Runtime, request: &ChatRequest, options: &CallOptions, json: bool) -> anyhow::Result<()> {
    let mut events = runtime.chat_completion(request, options).await?.into_stream();
    let mut out = std::io::stdout().lock();

    while let Some(event) = events.next().await {
        if json {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
            out.flush()?;
            continue;
        }

        match event {
            StreamEvent::TextDelta { text } => {
                write!(out, "{text}")?;
                out.flush()?;
            }
            StreamEvent::ToolCallComplete { name, args, .. } => writeln!(out, "\n[tool call] {name}({args})")?,
            StreamEvent::Warning { message } => tracing::warn!(%message, "request adapted"),
            StreamEvent::Usage(usage) => tracing::info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "usage"
            ),
            StreamEvent::FinishReason { reason } => {
                writeln!(out)?;
                tracing::debug!(reason = reason.as_str(), "finished");
            }
            StreamEvent::Error(error) if error.kind() == ErrorKind::ToolArgsParseFailure => {
                tracing::warn!(error = %error, "tool call arguments could not be parsed");
            }
            StreamEvent::Error(error) => return Err(error.into()),
            StreamEvent::Cancelled => {
                writeln!(out)?;
                tracing::info!("call cancelled");
            }
            StreamEvent::ReasoningDelta { .. } | StreamEvent::ToolCallDelta { .. } => {}
        }
    }
    Ok(())
}
