//! Interactive REPL.

use crate::commands::{format_info, format_message, parse_headers};
use colored::Colorize;
use rstomp_client::{Ack, Client, ClientOptions, Subscription};
use rstomp_protocol::Headers;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;

const HELP_TEXT: &str = r#"
Available commands:
  help                              Show this help
  info                              Show the negotiated session

  send <dest> <body...>             Send a message
  sendr <dest> <body...>            Send and wait for the receipt
  header <name:value>               Add a header to the next send
  subscribe <dest> [ack] [id]       Subscribe (ack: auto, client, client-individual)
  unsubscribe <id>                  Cancel a subscription
  subscriptions                     List subscriptions

  ack <id> [tx]                     Acknowledge a message
  nack <id> [tx]                    Reject a message
  begin [tx]                        Open a transaction
  commit <tx>                       Commit a transaction
  abort <tx>                        Abort a transaction
  txsend <tx> <dest> <body...>      Send inside a transaction

  quit, exit                        Disconnect and exit
"#;

/// A subscription whose messages are printed by a background task.
struct ActiveSubscription {
    destination: String,
    ack: Ack,
    printer: JoinHandle<()>,
}

/// REPL state kept between commands.
struct Session {
    client: Client,
    subscriptions: BTreeMap<String, ActiveSubscription>,
    pending_headers: Headers,
}

async fn print_messages(mut subscription: Subscription) {
    while let Some(message) = subscription.next().await {
        println!(
            "\n{} {}\n{}\n",
            "MESSAGE".yellow(),
            subscription.id().cyan(),
            format_message(&message)
        );
    }
}

pub async fn run(options: ClientOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "rstomp CLI".bold().cyan());
    println!("Connecting to {}...", options.addr);

    let client = Client::connect(options).await?;
    println!(
        "{} (STOMP {}, session {})",
        "Connected!".green(),
        client.version(),
        client.session().unwrap_or("-")
    );

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".rstomp_history"))
        .unwrap_or_else(|_| ".rstomp_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    let mut session = Session {
        client,
        subscriptions: BTreeMap::new(),
        pending_headers: Headers::new(),
    };
    let mut errors = session.client.errors();

    loop {
        while let Ok(error) = errors.try_recv() {
            println!(
                "{}: {}\n{}",
                "ERROR".red().bold(),
                error.header("message").unwrap_or("-"),
                error.body_as_string()
            );
        }
        if !session.client.is_connected() {
            println!("{}", "Connection lost.".red());
            break;
        }

        let prompt = format!("{} ", "rstomp>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&mut session, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    for (_, active) in std::mem::take(&mut session.subscriptions) {
        active.printer.abort();
    }
    if session.client.is_connected() {
        let _ = session.client.disconnect().await;
    }
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    session: &mut Session,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];
    let client = &session.client;

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "info" => Ok(Some(format_info(client))),

        "header" | "h" => {
            if args.is_empty() {
                return Ok(Some("Usage: header <name:value>".to_string()));
            }
            let parsed = parse_headers(&[args.join(" ")])?;
            for (name, value) in parsed.iter() {
                session.pending_headers.set(name, value);
            }
            Ok(Some(format!(
                "{} header(s) pending",
                session.pending_headers.len()
            )))
        }

        "send" | "s" | "sendr" => {
            if args.is_empty() {
                return Ok(Some(format!("Usage: {} <destination> <body...>", cmd)));
            }
            let destination = args[0];
            let body = args[1..].join(" ");
            let headers = std::mem::take(&mut session.pending_headers);
            if cmd == "sendr" {
                client.send_with_receipt(destination, headers, body).await?;
                Ok(Some(format!(
                    "{} to {} (receipt confirmed)",
                    "Sent".green(),
                    destination.cyan()
                )))
            } else {
                client.send_with_headers(destination, headers, body).await?;
                Ok(Some(format!("{} to {}", "Sent".green(), destination.cyan())))
            }
        }

        "subscribe" | "sub" => {
            if args.is_empty() {
                return Ok(Some(
                    "Usage: subscribe <destination> [ack] [id]".to_string(),
                ));
            }
            let destination = args[0];
            let ack = args
                .get(1)
                .map(|a| a.parse::<Ack>())
                .transpose()?
                .unwrap_or_default();
            let mut headers = Headers::new();
            headers.set("ack", ack.as_str());
            if let Some(id) = args.get(2) {
                headers.set("id", *id);
            }
            let subscription = client.subscribe_with_headers(destination, headers).await?;
            let output = format!(
                "{} {} (id: {}, ack: {})",
                "Subscribed to".green(),
                destination.cyan(),
                subscription.id(),
                ack.as_str()
            );
            let id = subscription.id().to_string();
            let active = ActiveSubscription {
                destination: destination.to_string(),
                ack,
                printer: tokio::spawn(print_messages(subscription)),
            };
            if let Some(previous) = session.subscriptions.insert(id, active) {
                previous.printer.abort();
            }
            Ok(Some(output))
        }

        "unsubscribe" | "unsub" => {
            if args.is_empty() {
                return Ok(Some("Usage: unsubscribe <id>".to_string()));
            }
            client.unsubscribe(args[0]).await?;
            if let Some(active) = session.subscriptions.remove(args[0]) {
                active.printer.abort();
            }
            Ok(Some(format!("{} {}", "Unsubscribed".green(), args[0].cyan())))
        }

        "subscriptions" | "subs" => {
            if session.subscriptions.is_empty() {
                return Ok(Some("No subscriptions".yellow().to_string()));
            }
            let mut output = String::new();
            for (id, active) in &session.subscriptions {
                output.push_str(&format!(
                    "  {} -> {} ({})\n",
                    id.cyan(),
                    active.destination,
                    active.ack.as_str()
                ));
            }
            Ok(Some(output))
        }

        "ack" | "nack" => {
            if args.is_empty() {
                return Ok(Some(format!("Usage: {} <id> [transaction]", cmd)));
            }
            let transaction = args.get(1).copied();
            if cmd == "ack" {
                client.ack(args[0], transaction).await?;
            } else {
                client.nack(args[0], transaction).await?;
            }
            Ok(Some(format!("{} {}", cmd.to_uppercase().green(), args[0])))
        }

        "begin" => {
            let tx = client.begin(args.first().copied()).await?;
            Ok(Some(format!("{} transaction {}", "Began".green(), tx.cyan())))
        }

        "commit" | "abort" => {
            if args.is_empty() {
                return Ok(Some(format!("Usage: {} <transaction>", cmd)));
            }
            if cmd == "commit" {
                client.commit(args[0]).await?;
                Ok(Some(format!("{} {}", "Committed".green(), args[0].cyan())))
            } else {
                client.abort(args[0]).await?;
                Ok(Some(format!("{} {}", "Aborted".yellow(), args[0].cyan())))
            }
        }

        "txsend" => {
            if args.len() < 2 {
                return Ok(Some(
                    "Usage: txsend <transaction> <destination> <body...>".to_string(),
                ));
            }
            let body = args[2..].join(" ");
            client.send_in_transaction(args[0], args[1], body).await?;
            Ok(Some(format!(
                "{} to {} in {}",
                "Buffered".green(),
                args[1].cyan(),
                args[0]
            )))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
