//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use rstomp_client::{Ack, Client};
use rstomp_protocol::{headers, Frame, Headers};

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Info => Ok(format_info(client)),

        Commands::Send {
            destination,
            body,
            headers: raw_headers,
            content_type,
            receipt,
        } => {
            let mut extra = parse_headers(&raw_headers)?;
            if let Some(content_type) = content_type {
                extra.set(headers::CONTENT_TYPE, content_type);
            }
            let body = parse_body_arg(&body)?;
            let size = body.len();

            if receipt {
                client.send_with_receipt(&destination, extra, body).await?;
                Ok(format!(
                    "{} {} bytes to {} (receipt confirmed)",
                    "Sent".green(),
                    size,
                    destination.cyan()
                ))
            } else {
                client.send_with_headers(&destination, extra, body).await?;
                Ok(format!("{} {} bytes to {}", "Sent".green(), size, destination.cyan()))
            }
        }

        // Subscribe streams and is handled in main.rs
        Commands::Subscribe { .. } => unreachable!(),

        // HashPasscode is handled directly in main.rs (no server connection needed)
        Commands::HashPasscode { .. } => unreachable!(),
    }
}

/// Prints messages from `destination` until `count` arrived or Ctrl+C.
pub async fn subscribe(
    client: &Client,
    destination: &str,
    ack: Ack,
    id: Option<String>,
    count: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut subscription_headers = Headers::new();
    subscription_headers.set(headers::ACK, ack.as_str());
    if let Some(id) = id {
        subscription_headers.set(headers::ID, id);
    }
    let mut subscription = client
        .subscribe_with_headers(destination, subscription_headers)
        .await?;
    eprintln!(
        "{} {} (id: {}, ack: {})",
        "Subscribed to".green(),
        destination.cyan(),
        subscription.id(),
        ack.as_str()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    let mut errors = client.errors();
    let mut received = 0usize;
    loop {
        if count.is_some_and(|limit| received >= limit) {
            break;
        }
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    eprintln!("{}", "Connection closed".red());
                    break;
                };
                received += 1;
                println!("{}", format_message(&message));
                if ack != Ack::Auto {
                    client.ack_message(&message).await?;
                }
            }
            error = errors.recv() => {
                if let Ok(frame) = error {
                    return Err(format!(
                        "{}: {}",
                        frame.header(headers::MESSAGE).unwrap_or("server error"),
                        frame.body_as_string()
                    )
                    .into());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }

    if client.is_connected() {
        client.unsubscribe(subscription.id()).await?;
    }
    Ok(())
}

/// Formats the negotiated session.
pub fn format_info(client: &Client) -> String {
    let connection = client.connection();
    let (ping, pong) = connection.heartbeat_periods();
    format!(
        "  Version:    {}\n  Session:    {}\n  Server:     {}\n  Heart-beat: send every {}ms, expect within {}ms",
        client.version().yellow(),
        client.session().unwrap_or("-"),
        client.server().unwrap_or("-"),
        ping,
        pong
    )
}

/// Formats a MESSAGE frame: its headers, a blank line, then the body.
pub fn format_message(message: &Frame) -> String {
    let mut output = String::new();
    for (name, value) in message.headers().iter() {
        output.push_str(&format!("{}:{}\n", name.cyan(), value));
    }
    output.push('\n');
    output.push_str(&message.body_as_string());
    output
}

/// Parses repeated `name:value` arguments. The value may contain ':'.
pub fn parse_headers(raw: &[String]) -> Result<Headers, String> {
    let mut parsed = Headers::new();
    for entry in raw {
        match entry.split_once(':') {
            Some((name, value)) if !name.is_empty() => {
                parsed.add(name.trim(), value.trim());
            }
            _ => return Err(format!("invalid header '{}', expected name:value", entry)),
        }
    }
    Ok(parsed)
}

/// Parses a body argument (either inline text or @file).
pub fn parse_body_arg(arg: &str) -> Result<Bytes, std::io::Error> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
        None => Ok(Bytes::copy_from_slice(arg.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstomp_protocol::Command;
    use std::io::Write;

    #[test]
    fn test_parse_headers() {
        let parsed = parse_headers(&["x-id:7".to_string(), "url: http://a:1".to_string()]).unwrap();
        assert_eq!(parsed.get("x-id"), Some("7"));
        assert_eq!(parsed.get("url"), Some("http://a:1"));

        assert!(parse_headers(&["novalue".to_string()]).is_err());
        assert!(parse_headers(&[":value".to_string()]).is_err());
    }

    #[test]
    fn test_parse_headers_first_wins() {
        let parsed = parse_headers(&["a:1".to_string(), "a:2".to_string()]).unwrap();
        assert_eq!(parsed.get("a"), Some("1"));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_parse_body_arg() {
        assert_eq!(parse_body_arg("hello").unwrap(), Bytes::from_static(b"hello"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"from file\0binary").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(
            parse_body_arg(&arg).unwrap(),
            Bytes::from_static(b"from file\0binary")
        );

        assert!(parse_body_arg("@/nonexistent/body.txt").is_err());
    }

    #[test]
    fn test_format_message() {
        colored::control::set_override(false);
        let mut message_headers = Headers::new();
        message_headers.add("destination", "/queue/a");
        message_headers.add("message-id", "m-1");
        let frame = Frame::try_new(
            Command::Message,
            message_headers,
            Some(Bytes::from_static(b"payload")),
        )
        .unwrap();
        assert_eq!(
            format_message(&frame),
            "destination:/queue/a\nmessage-id:m-1\n\npayload"
        );
    }
}
