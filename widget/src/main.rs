use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use assistant_widget::{
    client::RelayClient,
    protocol::Role,
    session::{EventOutcome, FileStore, WidgetSession, WidgetState},
};
use clap::Parser;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Terminal rendition of the embeddable chat widget.
#[derive(Debug, Parser)]
#[command(name = "assistant-widget", version)]
struct Args {
    /// Origin of the assistant server.
    #[arg(long, env = "WIDGET_HOST_URL", default_value = "http://localhost:4000")]
    host: String,

    #[arg(long, env = "WIDGET_CHATBOT_ID")]
    chatbot_id: String,

    /// Where the visitor session is cached between runs.
    #[arg(long, default_value = ".assistant-widget.json")]
    store: PathBuf,

    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(Targets::new().with_default(LevelFilter::WARN).with_target("assistant_widget", level))
        .try_init()
        .ok();

    let client = RelayClient::new(&args.host);
    match client.verify(&args.chatbot_id).await {
        Ok(profile) => println!(
            "Connected to {} ({})",
            profile.name.as_deref().unwrap_or("assistant"),
            profile.model.as_deref().unwrap_or("unknown model")
        ),
        Err(err @ assistant_widget::WidgetError::InvalidChatbot(..)) => return Err(err.into()),
        // The pre-flight check is advisory; a transport failure still lets
        // the visitor try to chat.
        Err(err) => eprintln!("could not verify chatbot: {err}"),
    }

    let store = FileStore::open(&args.store)
        .with_context(|| format!("opening session cache {}", args.store.display()))?;
    let mut session = WidgetSession::load(store, &args.chatbot_id);
    for entry in session.transcript() {
        print_entry(entry.role, &entry.content);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        if session.state() == WidgetState::CollectingIdentity {
            println!("Before we start chatting (provide either email or phone)");
            let name = prompt(&mut lines, "Name: ")?;
            let email = prompt(&mut lines, "Email: ")?;
            let phone = prompt(&mut lines, "Phone: ")?;
            match session.submit_identity(&name, &email, &phone) {
                Ok(()) => {
                    if let Some(entry) = session.transcript().last() {
                        print_entry(entry.role, &entry.content);
                    }
                }
                Err(err) => eprintln!("{err}"),
            }
            continue;
        }

        let line = prompt(&mut lines, "> ")?;
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/export" => {
                println!("{}", serde_json::to_string_pretty(&session.export_json())?);
                continue;
            }
            "/logout" => {
                session.logout()?;
                continue;
            }
            _ => {}
        }

        let mut printed = 0usize;
        let result = client
            .send_turn(&mut session, &line, |outcome| match outcome {
                EventOutcome::Streaming(text) => {
                    if printed == 0 {
                        print!("assistant: ");
                    }
                    print!("{}", &text[printed.min(text.len())..]);
                    printed = text.len();
                    io::stdout().flush().ok();
                }
                EventOutcome::Completed(text) => {
                    if printed == 0 {
                        print!("assistant: {text}");
                    } else if text.len() > printed && text.is_char_boundary(printed) {
                        print!("{}", &text[printed..]);
                    }
                    println!();
                }
                EventOutcome::Failed(_) => {
                    if printed > 0 {
                        println!();
                    }
                }
                EventOutcome::Ignored => {}
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, "message failed");
        }
        if let Some(entry) = session.transcript().last() {
            if entry.role == Role::Assistant && session.history().last() != Some(entry) {
                print_entry(entry.role, &entry.content);
            }
        }
    }
    Ok(())
}

fn prompt(lines: &mut impl Iterator<Item = io::Result<String>>, label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(line?),
        None => anyhow::bail!("input closed"),
    }
}

fn print_entry(role: Role, content: &str) {
    println!("{}: {content}", role.as_str());
}
