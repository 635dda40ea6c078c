use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{ClientConfig, ConsoleClient, ConsoleEvent};
use shared::domain::{ActiveMode, AlertPriority, ClientRole, MessageId, MessageSeverity};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
struct Args {
    /// http(s) base URL of the sync server.
    #[arg(long)]
    server_url: String,
    /// Supervisor session to authenticate with.
    #[arg(long)]
    session_id: String,
    /// Operator name shown in the prompt.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let client = ConsoleClient::new(ClientConfig {
        server_url: args.server_url,
        role: ClientRole::Controller,
        session_id: Some(args.session_id),
    });

    // Subscribe before connecting so the first status transition is printed.
    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConsoleEvent::Status(status) => println!("* connection: {status:?}"),
                ConsoleEvent::Server(server_event) => match serde_json::to_string(&server_event) {
                    Ok(json) => println!("< {json}"),
                    Err(_) => println!("< {server_event:?}"),
                },
                ConsoleEvent::Error(message) => eprintln!("! {message}"),
            }
        }
    });

    client.connect().await?;
    match &args.name {
        Some(name) => println!("Console up for {name}. Type `help` for commands."),
        None => println!("Console up. Type `help` for commands."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Err(error) = run_line(&client, line).await {
            eprintln!("! {error}");
        }
    }

    client.close().await;
    printer.abort();
    Ok(())
}

async fn run_line(client: &ConsoleClient, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(());
    };

    match command {
        "help" => {
            print_help();
            Ok(())
        }
        "ack" => {
            let alert_id = parts.next().context("usage: ack <alertId> [reason…]")?;
            client.acknowledge_alert(alert_id, rest(parts)).await
        }
        "priority" => {
            let usage = "usage: priority <alertId> <low|medium|high|critical> <reason…>";
            let alert_id = parts.next().context(usage)?;
            let level = parse_priority(parts.next().context(usage)?)?;
            let reason = rest(parts).context(usage)?;
            client.update_priority(alert_id, level, reason).await
        }
        "note" => {
            let usage = "usage: note <alertId> <text…>";
            let alert_id = parts.next().context(usage)?;
            let text = rest(parts).context(usage)?;
            client.add_note(alert_id, text).await
        }
        "broadcast" => {
            let usage = "usage: broadcast <info|warning|critical> <durationMs> <text…>";
            let severity = parse_severity(parts.next().context(usage)?)?;
            let duration_ms: u64 = parts.next().context(usage)?.parse().context(usage)?;
            let text = rest(parts).context(usage)?;
            client.broadcast_message(text, severity, duration_ms).await
        }
        "clear" => {
            let raw = parts.next().context("usage: clear <messageId>")?;
            let message_id = MessageId(raw.parse().context("message id is not a UUID")?);
            client.clear_message(message_id).await
        }
        "mode" => {
            let mode = parse_mode(
                parts
                    .next()
                    .context("usage: mode <normal|emergency|maintenance>")?,
            )?;
            client.set_mode(mode).await
        }
        "state" => client.request_state().await,
        "ping" => client.ping().await,
        other => bail!("unknown command `{other}`; type `help`"),
    }
}

fn rest<'a>(parts: impl Iterator<Item = &'a str>) -> Option<String> {
    let text = parts.collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn parse_priority(raw: &str) -> Result<AlertPriority> {
    match raw {
        "low" => Ok(AlertPriority::Low),
        "medium" => Ok(AlertPriority::Medium),
        "high" => Ok(AlertPriority::High),
        "critical" => Ok(AlertPriority::Critical),
        other => bail!("unknown priority `{other}`"),
    }
}

fn parse_severity(raw: &str) -> Result<MessageSeverity> {
    match raw {
        "info" => Ok(MessageSeverity::Info),
        "warning" => Ok(MessageSeverity::Warning),
        "critical" => Ok(MessageSeverity::Critical),
        other => bail!("unknown severity `{other}`"),
    }
}

fn parse_mode(raw: &str) -> Result<ActiveMode> {
    match raw {
        "normal" => Ok(ActiveMode::Normal),
        "emergency" => Ok(ActiveMode::Emergency),
        "maintenance" => Ok(ActiveMode::Maintenance),
        other => bail!("unknown mode `{other}`"),
    }
}

fn print_help() {
    println!("  ack <alertId> [reason…]");
    println!("  priority <alertId> <low|medium|high|critical> <reason…>");
    println!("  note <alertId> <text…>");
    println!("  broadcast <info|warning|critical> <durationMs> <text…>");
    println!("  clear <messageId>");
    println!("  mode <normal|emergency|maintenance>");
    println!("  state");
    println!("  ping");
    println!("  quit");
}
