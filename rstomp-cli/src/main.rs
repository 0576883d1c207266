//! rstomp-cli - Command-line STOMP client
//!
//! Provides both a REPL and one-shot commands.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rstomp_client::{Ack, Client, ClientOptions, TlsClientConfig};
use rstomp_protocol::Heartbeat;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstomp-cli")]
#[command(about = "Command-line client for STOMP brokers")]
#[command(version)]
pub struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    server: SocketAddr,

    /// Login sent in CONNECT
    #[arg(short, long, env = "RSTOMP_LOGIN")]
    login: Option<String>,

    /// Passcode sent in CONNECT
    #[arg(short, long, env = "RSTOMP_PASSCODE", hide_env_values = true)]
    passcode: Option<String>,

    /// Virtual host sent in the host header
    #[arg(long)]
    vhost: Option<String>,

    /// Accepted protocol versions, most preferred first
    #[arg(long, value_delimiter = ',', default_value = "1.2,1.1,1.0")]
    accept_version: Vec<String>,

    /// Heart-beat proposal as "<send-ms>,<receive-ms>"
    #[arg(long, default_value = "10000,10000")]
    heart_beat: Heartbeat,

    /// Send STOMP instead of CONNECT
    #[arg(long)]
    stomp_frame: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "RSTOMP_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "RSTOMP_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "RSTOMP_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "RSTOMP_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server address)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Show the negotiated session
    Info,

    /// Send a message
    Send {
        /// Destination
        destination: String,

        /// Message body (or @file to read from file)
        #[arg(default_value = "")]
        body: String,

        /// Extra header as "name:value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Content type of the body
        #[arg(short = 'c', long)]
        content_type: Option<String>,

        /// Wait for the server to confirm with a RECEIPT
        #[arg(short, long)]
        receipt: bool,
    },

    /// Subscribe and print received messages
    Subscribe {
        /// Destination
        destination: String,

        /// Acknowledgement mode: auto, client or client-individual
        #[arg(short, long, default_value = "auto")]
        ack: Ack,

        /// Subscription id (defaults to the destination)
        #[arg(long)]
        id: Option<String>,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Generate the SHA-256 hash of a passcode for config files
    HashPasscode {
        /// The passcode to hash
        passcode: String,
    },
}

impl Cli {
    fn tls_config(&self) -> Result<Option<TlsClientConfig>, String> {
        if !(self.tls || self.ca_cert.is_some() || self.client_cert.is_some() || self.insecure) {
            return Ok(None);
        }
        let mut tls = TlsClientConfig::new();
        if let Some(ref path) = self.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".to_string()),
        }
        if self.insecure {
            tls = tls.with_insecure();
        }
        if let Some(ref name) = self.server_name {
            tls = tls.with_server_name(name);
        }
        Ok(Some(tls))
    }

    fn client_options(&self) -> Result<ClientOptions, String> {
        let versions: Vec<&str> = self.accept_version.iter().map(String::as_str).collect();
        let mut options = ClientOptions::new(self.server)
            .with_accepted_versions(&versions)
            .with_heartbeat(self.heart_beat)
            .with_stomp_frame(self.stomp_frame);
        if let (Some(login), Some(passcode)) = (&self.login, &self.passcode) {
            options = options.with_credentials(login, passcode);
        } else if let Some(ref login) = self.login {
            options = options.with_credentials(login, "");
        }
        if let Some(ref vhost) = self.vhost {
            options = options.with_virtual_host(vhost);
        }
        if let Some(tls) = self.tls_config()? {
            options = options.with_tls(tls);
        }
        Ok(options)
    }
}

fn hash_passcode(passcode: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(passcode.as_bytes());
    hex::encode(hasher.finalize())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // no server connection needed
    if let Some(Commands::HashPasscode { passcode }) = &cli.command {
        println!("{}", hash_passcode(passcode));
        return Ok(());
    }

    let options = match cli.client_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(options).await?;
        }
        Some(Commands::HashPasscode { .. }) => unreachable!(),
        Some(Commands::Subscribe {
            destination,
            ack,
            id,
            count,
        }) => {
            let client = connect(options).await?;
            let result = commands::subscribe(&client, &destination, ack, id, count).await;
            let _ = client.disconnect().await;
            if let Err(e) = result {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        Some(cmd) => {
            let client = connect(options).await?;
            let result = commands::execute(&client, cmd).await;
            let _ = client.disconnect().await;
            match result {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn connect(options: ClientOptions) -> Result<Client, Box<dyn std::error::Error>> {
    Client::connect(options).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_passcode() {
        assert_eq!(
            hash_passcode("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["rstomp-cli"]);
        let options = cli.client_options().unwrap();
        assert_eq!(options.addr, "127.0.0.1:61613".parse().unwrap());
        assert_eq!(options.accepted_versions, vec!["1.2", "1.1", "1.0"]);
        assert_eq!(options.heartbeat, Heartbeat::new(10000, 10000));
        assert!(options.tls.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_send_arguments() {
        let cli = Cli::parse_from([
            "rstomp-cli",
            "--login",
            "guest",
            "--passcode",
            "pw",
            "send",
            "/queue/a",
            "hello",
            "-H",
            "x-id:7",
            "--receipt",
        ]);
        let options = cli.client_options().unwrap();
        assert_eq!(options.login.as_deref(), Some("guest"));
        assert_eq!(options.passcode.as_deref(), Some("pw"));
        match cli.command {
            Some(Commands::Send {
                destination,
                body,
                headers,
                receipt,
                ..
            }) => {
                assert_eq!(destination, "/queue/a");
                assert_eq!(body, "hello");
                assert_eq!(headers, vec!["x-id:7"]);
                assert!(receipt);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_subscribe_ack_mode() {
        let cli = Cli::parse_from(["rstomp-cli", "subscribe", "/topic/t", "--ack", "client", "-n", "3"]);
        match cli.command {
            Some(Commands::Subscribe { ack, count, .. }) => {
                assert_eq!(ack, Ack::Client);
                assert_eq!(count, Some(3));
            }
            _ => panic!("expected subscribe"),
        }
        assert!(Cli::try_parse_from(["rstomp-cli", "subscribe", "/t", "--ack", "never"]).is_err());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let cli = Cli::parse_from(["rstomp-cli", "--client-cert", "c.pem"]);
        assert!(cli.tls_config().is_err());

        let cli = Cli::parse_from(["rstomp-cli", "-k", "--server-name", "broker"]);
        let tls = cli.tls_config().unwrap().unwrap();
        assert!(tls.insecure);
        assert_eq!(tls.server_name.as_deref(), Some("broker"));
    }
}
