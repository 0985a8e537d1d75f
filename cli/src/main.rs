use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use pusher_web::net::error::TransportError;
use pusher_web::net::push::{PushMessage, PushResponse, PushTransport, test_channel};
use pusher_web::state::session::{USER_KEY, is_admin_in, is_root_in};
use pusher_web::util::navigate::Navigator;
use pusher_web::util::notify::{Notifier, Toaster};
use pusher_web::util::text::{remove_trailing_slash, verify_json};
use pusher_web::util::time::{format_timestamp_in, timestamp_to_string};
use pusher_web::util::toast::{Severity, ToastOptions};
use pusher_web::util::token::generate_token;
use pusher_web::util::viewport::Viewport;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "pusher-cli", about = "Message push client helpers")]
struct Cli {
    #[arg(long, env = "PUSHER_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a random uppercase hex token.
    Token {
        #[arg(long, default_value_t = 16)]
        bytes: usize,
    },
    /// Check whether TEXT is valid JSON.
    VerifyJson { text: String },
    /// Format Unix seconds as `YYYY-MM-DD HH:MM:SS`.
    Timestamp {
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
        #[arg(long)]
        utc: bool,
    },
    /// Print the privilege level of a stored session user record.
    Role { file: PathBuf },
    /// Send a test message through a push channel.
    TestChannel {
        #[arg(long)]
        username: String,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        channel: String,
    },
}

/// `PushTransport` over `reqwest`.
struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    fn new(base_url: &str) -> Result<Self, CliError> {
        let trimmed = remove_trailing_slash(base_url);
        reqwest::Url::parse(trimmed).map_err(|e| CliError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: trimmed.to_owned(),
        })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, TransportError> {
        reqwest::Url::parse(&format!("{}{path}", self.base_url)).map_err(|e| TransportError::Network(e.to_string()))
    }
}

#[async_trait(?Send)]
impl PushTransport for HttpTransport {
    async fn post(&self, path: &str, message: &PushMessage) -> Result<PushResponse, TransportError> {
        let url = self.url(path)?;
        tracing::debug!(%url, "posting push message");
        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<PushResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Prints toasts and redirects, remembering whether anything went wrong.
#[derive(Default)]
struct Terminal {
    failed: Cell<bool>,
}

impl Toaster for &Terminal {
    fn toast(&self, severity: Severity, message: &str, _options: ToastOptions) {
        match severity {
            Severity::Error => {
                self.failed.set(true);
                eprintln!("[error] {message}");
            }
            Severity::Warning => eprintln!("[warning] {message}"),
            Severity::Success | Severity::Info | Severity::Notice => {
                println!("[{}] {message}", severity.css_class());
            }
        }
    }
}

impl Navigator for &Terminal {
    fn open(&self, url: &str) {
        println!("open: {url}");
    }

    fn redirect(&self, href: &str) {
        self.failed.set(true);
        eprintln!("session expired; the web client would redirect to {href}");
    }
}

impl Viewport for &Terminal {
    fn width(&self) -> Option<f64> {
        None
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode, CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Token { bytes } => {
            println!("{}", generate_token(bytes));
            Ok(ExitCode::SUCCESS)
        }
        Command::VerifyJson { text } => Ok(run_verify_json(&text)),
        Command::Timestamp { seconds, utc } => {
            let rendered = if utc {
                format_timestamp_in(seconds, &chrono::Utc)
            } else {
                timestamp_to_string(seconds)
            };
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Role { file } => run_role(file),
        Command::TestChannel { username, token, channel } => {
            run_test_channel(&cli.base_url, &username, &token, &channel).await
        }
    }
}

fn run_verify_json(text: &str) -> ExitCode {
    if verify_json(text) {
        println!("valid");
        ExitCode::SUCCESS
    } else {
        println!("invalid");
        ExitCode::FAILURE
    }
}

fn role_label(session: &HashMap<String, String>) -> &'static str {
    if is_root_in(session) {
        "root"
    } else if is_admin_in(session) {
        "admin"
    } else {
        "user"
    }
}

fn run_role(file: PathBuf) -> Result<ExitCode, CliError> {
    let raw = std::fs::read_to_string(&file).map_err(|source| CliError::Read { path: file, source })?;
    let session = HashMap::from([(USER_KEY.to_owned(), raw)]);
    println!("{}", role_label(&session));
    Ok(ExitCode::SUCCESS)
}

async fn run_test_channel(base_url: &str, username: &str, token: &str, channel: &str) -> Result<ExitCode, CliError> {
    let transport = HttpTransport::new(base_url)?;
    let terminal = Terminal::default();
    let notifier = Notifier::new(&terminal, &terminal, &terminal);
    tracing::info!(%username, %channel, "testing push channel");
    test_channel(&transport, &notifier, username, token, channel).await;
    Ok(if terminal.failed.get() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_defaults_to_sixteen_bytes() {
        let cli = Cli::try_parse_from(["pusher-cli", "token"]).unwrap();
        assert!(matches!(cli.command, Command::Token { bytes: 16 }));
    }

    #[test]
    fn test_channel_defaults_to_empty_channel() {
        let cli = Cli::try_parse_from([
            "pusher-cli",
            "--base-url",
            "https://push.example.com",
            "test-channel",
            "--username",
            "alice",
            "--token",
            "T0K",
        ])
        .unwrap();
        assert_eq!(cli.base_url, "https://push.example.com");
        match cli.command {
            Command::TestChannel { username, token, channel } => {
                assert_eq!(username, "alice");
                assert_eq!(token, "T0K");
                assert_eq!(channel, "");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn timestamp_accepts_negative_seconds() {
        let cli = Cli::try_parse_from(["pusher-cli", "timestamp", "-60", "--utc"]).unwrap();
        assert!(matches!(cli.command, Command::Timestamp { seconds: -60, utc: true }));
    }

    #[test]
    fn test_channel_requires_username() {
        assert!(Cli::try_parse_from(["pusher-cli", "test-channel", "--token", "T"]).is_err());
    }

    #[test]
    fn role_label_ranks_records() {
        let record = |raw: &str| HashMap::from([(USER_KEY.to_owned(), raw.to_owned())]);
        assert_eq!(role_label(&record(r#"{"role":100}"#)), "root");
        assert_eq!(role_label(&record(r#"{"role":10}"#)), "admin");
        assert_eq!(role_label(&record(r#"{"role":1}"#)), "user");
        assert_eq!(role_label(&record("not json")), "user");
    }

    #[test]
    fn http_transport_rejects_bad_base_url() {
        assert!(matches!(HttpTransport::new("not a url"), Err(CliError::InvalidBaseUrl(_))));
    }

    #[test]
    fn http_transport_joins_push_path() {
        let transport = HttpTransport::new("https://push.example.com/").unwrap();
        assert_eq!(
            transport.url("/push/alice/").unwrap().as_str(),
            "https://push.example.com/push/alice/"
        );
    }

    #[test]
    fn http_transport_keeps_base_path_prefix() {
        let transport = HttpTransport::new("https://example.com/pusher").unwrap();
        assert_eq!(
            transport.url("/push/alice/").unwrap().as_str(),
            "https://example.com/pusher/push/alice/"
        );
    }

    #[test]
    fn terminal_marks_errors_and_redirects_as_failures() {
        let terminal = Terminal::default();
        (&terminal).toast(Severity::Success, "ok", ToastOptions::default());
        assert!(!terminal.failed.get());
        (&terminal).redirect("/login?expired=true");
        assert!(terminal.failed.get());
    }
}
