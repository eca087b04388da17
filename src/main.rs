//! `kik-echo`: logs in and echoes every direct or group message back to its sender.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use kik_session::events::{CaptchaChallenge, IncomingMessage, LoginSuccess};
use kik_session::requests::{ChatMessage, ReadReceipt};
use kik_session::{
    Credentials, DisconnectReason, KikClient, SessionCallbacks, SessionConfig, SessionHandle,
    SessionState,
};

/// Interval between keep-alive pings once authenticated.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

enum BotEvent {
    LoggedIn,
    Message(IncomingMessage),
    Captcha(CaptchaChallenge),
    Disconnected(DisconnectReason),
}

/// Forwards the events the bot acts on to the main loop.
struct EchoBot {
    events: mpsc::UnboundedSender<BotEvent>,
}

impl SessionCallbacks for EchoBot {
    fn on_authenticated(&self) {
        info!("Authenticated, echoing messages");
    }

    fn on_login_ended(&self, success: &LoginSuccess) {
        info!(node = %success.node, "Logged in, set KIK_NODE to skip the password login next time");
        let _ = self.events.send(BotEvent::LoggedIn);
    }

    fn on_login_error(&self, failure: &kik_session::events::LoginFailure) {
        error!(code = ?failure.code, message = %failure.message, "Login failed");
    }

    fn on_connection_failed(&self, failure: &kik_session::events::ConnectionFailure) {
        error!(message = %failure.message, backoff = ?failure.backoff, "Server refused the connection");
    }

    fn on_temp_ban_received(&self, ban: &kik_session::events::TempBan) {
        warn!(expiry = ?ban.expiry, title = ?ban.title, "Account temporarily banned");
    }

    fn on_chat_message(&self, message: &IncomingMessage) {
        let _ = self.events.send(BotEvent::Message(message.clone()));
    }

    fn on_group_message(&self, message: &IncomingMessage) {
        let _ = self.events.send(BotEvent::Message(message.clone()));
    }

    fn on_captcha_received(&self, captcha: &CaptchaChallenge) {
        let _ = self.events.send(BotEvent::Captcha(captcha.clone()));
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        let _ = self.events.send(BotEvent::Disconnected(reason.clone()));
    }
}

struct Options {
    verbose_level: Option<String>,
    log_file_path: Option<String>,
    config_path: Option<String>,
    dangerous_insecure_tls: bool,
}

fn parse_args(args: &[String]) -> Options {
    // --verbose / -v (no stanza payloads) or --verbose=xmpp (with payloads)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default".to_string())
        } else {
            arg.strip_prefix("--verbose=").map(str::to_string)
        }
    });
    Options {
        verbose_level,
        log_file_path: args
            .iter()
            .find_map(|arg| arg.strip_prefix("--log-file=").map(str::to_string)),
        config_path: args
            .iter()
            .find_map(|arg| arg.strip_prefix("--config=").map(str::to_string)),
        dangerous_insecure_tls: args.iter().any(|arg| arg == "--dangerous-insecure-tls"),
    }
}

fn print_help() {
    eprintln!("kik-echo v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: kik-echo [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no stanza payloads)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including stanza payloads");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --config=PATH     JSON session configuration");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  KIK_USERNAME, KIK_PASSWORD   Account credentials (required)");
    eprintln!("  KIK_NODE                     Node from a previous login");
    eprintln!("  KIK_DEVICE_ID, KIK_ANDROID_ID  Device identity overrides");
    eprintln!("  RUST_LOG                     Override log filter (e.g. RUST_LOG=debug)");
}

fn log_dir(log_file_path: Option<&str>) -> PathBuf {
    if let Some(path) = log_file_path {
        return PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
    }
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("kik-session").join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("kik-session"))
        .unwrap_or(dir);

    dir
}

/// File log always; stderr when verbose, `--log-file` or `RUST_LOG` is set.
fn init_tracing(options: &Options) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir(options.log_file_path.as_deref());
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("kik_session=info,kik_echo=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kik-echo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let verbose = options.verbose_level.is_some();
    let stderr_layer = if verbose || options.log_file_path.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if options.verbose_level.as_deref() == Some("xmpp") {
            EnvFilter::new("kik_session=info,kik_session::session=debug,kik_echo=debug,info")
        } else {
            EnvFilter::new("kik_session=info,kik_echo=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", log_dir.display());
    guard
}

fn load_config(options: &Options) -> Result<SessionConfig, String> {
    let mut config = match &options.config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {}", path, e))?;
            serde_json::from_str::<SessionConfig>(&raw)
                .map_err(|e| format!("invalid config {}: {}", path, e))?
        }
        None => SessionConfig::default(),
    };
    if options.dangerous_insecure_tls {
        config.dangerous_insecure_tls = true;
    }
    if let Ok(device_id) = std::env::var("KIK_DEVICE_ID") {
        config.device.device_id = device_id;
    }
    if let Ok(android_id) = std::env::var("KIK_ANDROID_ID") {
        config.device.android_id = android_id;
    }
    Ok(config)
}

fn load_credentials() -> Result<Credentials, String> {
    let username = std::env::var("KIK_USERNAME").map_err(|_| "KIK_USERNAME is not set".to_string())?;
    let password = std::env::var("KIK_PASSWORD").map_err(|_| "KIK_PASSWORD is not set".to_string())?;
    let credentials = Credentials::password(username, password);
    Ok(match std::env::var("KIK_NODE") {
        Ok(node) if !node.is_empty() => credentials.with_node(node),
        _ => credentials,
    })
}

/// Mark the message read and send its body back.
async fn echo(handle: SessionHandle, message: IncomingMessage) {
    let Some(body) = message.body.clone() else {
        return;
    };
    let reply_to = message.group_jid.clone().unwrap_or_else(|| message.from_jid.clone());

    if message.request_read_receipt {
        let receipt = ReadReceipt::new(
            message.from_jid.clone(),
            vec![message.message_id.clone()],
            message.group_jid.clone(),
            handle.server_time_millis(),
        );
        if let Err(e) = handle.send(&receipt).await {
            warn!(error = %e, "Read receipt not sent");
        }
    }

    let reply = ChatMessage::new(reply_to, body, handle.server_time_millis());
    match handle.send(&reply).await {
        Ok(()) => info!(to = %message.from_jid, "Echoed message"),
        Err(e) => warn!(error = %e, "Echo not sent"),
    }
}

async fn read_captcha_answer() -> Option<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(line)) if !line.trim().is_empty() => Some(line.trim().to_string()),
        _ => None,
    }
}

async fn run(config: SessionConfig, credentials: Credentials) -> ExitCode {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut client = KikClient::new(config, credentials, Arc::new(EchoBot { events: events_tx }));

    let mut handle = match client.connect().await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Connection failed");
            return ExitCode::FAILURE;
        }
    };

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    // Shutdown notifications still owed by login streams that were replaced.
    let mut replaced = 0usize;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BotEvent::LoggedIn) => {
                    match client.establish_authenticated_session(&handle).await {
                        Ok(next) => {
                            info!(node = ?client.credentials().node, "Switched to the authenticated stream");
                            handle = next;
                            replaced += 1;
                        }
                        Err(e) => {
                            error!(error = %e, "Could not open the authenticated stream");
                            return ExitCode::FAILURE;
                        }
                    }
                }
                Some(BotEvent::Message(message)) => {
                    tokio::spawn(echo(handle.clone(), message));
                }
                Some(BotEvent::Captcha(captcha)) => {
                    eprintln!("Solve the captcha at:\n  {}\nthen paste the response token:", captcha.url);
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        match read_captcha_answer().await {
                            Some(answer) => {
                                if let Err(e) = handle.answer_captcha(answer).await {
                                    warn!(error = %e, "Captcha answer rejected");
                                }
                            }
                            None => handle.shutdown(),
                        }
                    });
                }
                Some(BotEvent::Disconnected(DisconnectReason::Shutdown)) if replaced > 0 => {
                    replaced -= 1;
                }
                Some(BotEvent::Disconnected(reason)) => {
                    info!(reason = ?reason, "Session ended");
                    return match reason {
                        DisconnectReason::Shutdown => ExitCode::SUCCESS,
                        _ => ExitCode::FAILURE,
                    };
                }
                None => return ExitCode::FAILURE,
            },
            _ = keepalive.tick() => {
                if handle.state() == SessionState::Authenticated {
                    if let Err(e) = handle.ping().await {
                        warn!(error = %e, "Keep-alive ping failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session");
                handle.shutdown();
                handle.closed().await;
                return ExitCode::SUCCESS;
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }
    let options = parse_args(&args);

    if options.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    // Dropping the guard stops the background log writer.
    let _guard = init_tracing(&options);

    let config = match load_config(&options) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let credentials = match load_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    run(config, credentials).await
}
