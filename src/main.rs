mod config;
mod constants;
mod credentials;
mod error;
mod listener;
mod mail;
mod oauth2;
mod publish;
mod retry;
mod schedule;
mod service;
mod store;
mod supervisor;

use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::credentials::{CredentialResolver, KeyringSecretStore, SecretKind, SecretStore};
use crate::mail::{ImapConnector, MailConnector};
use crate::oauth2::OAuth2Client;
use crate::service::Service;
use crate::store::{FolderStateStore, LeaseKey, Store};

fn setup_logging(log_file: Option<&Path>) {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,inboxd=debug"));

    let file = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path.display(), e))
            .ok()
    });

    if let Some(file) = file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"inboxd - resilient IMAP mailbox ingestion

Usage: inboxd <command>

Commands:
    run                          Watch every enabled provider until interrupted
    check                        Connect to each enabled provider and select its folders
    status                       Show stored folder cursors and leases
    set-secret <provider> <kind> Store a secret read from stdin
                                 kinds: password, oauth-client-secret, refresh-token
    reset <provider> <folder>    Forget a folder cursor (next start rescans recent mail)
    help                         Show this help message

Configuration file: $INBOXD_CONFIG or ~/.config/inboxd/config.toml
Send SIGHUP to a running instance to reload its configuration.
"#
    );
}

fn load_config() -> Result<Config> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    Ok(config)
}

async fn run_service() -> Result<()> {
    let config = load_config()?;
    setup_logging(config.log_file.as_deref());

    if config.enabled_providers().next().is_none() {
        tracing::warn!("No enabled providers configured; waiting for a reload");
    }
    Service::from_config(config).await?.run().await
}

/// Authenticate against every enabled provider and select its folders.
async fn run_check() -> Result<()> {
    let config = load_config()?;
    setup_logging(config.log_file.as_deref());

    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new());
    let refresher = OAuth2Client::new(config.tuning.connect_timeout())?;
    let resolver = CredentialResolver::new(secrets, Arc::new(refresher));
    let connector = ImapConnector::new()?;

    let mut failed = 0;
    for provider in config.enabled_providers() {
        resolver.register(provider);
        println!("{} ({}:{})", provider.id, provider.imap.server, provider.imap.port);

        let credential = match resolver.resolve(&provider.id).await {
            Ok(credential) => credential,
            Err(e) => {
                println!("  credentials: FAILED ({})", e);
                failed += 1;
                continue;
            }
        };
        let timeout = config.tuning.for_provider(&provider.tuning).connect_timeout();
        let mut session = match connector.connect(provider, &credential, timeout).await {
            Ok(session) => session,
            Err(e) => {
                println!("  connect: FAILED ({})", e);
                failed += 1;
                continue;
            }
        };
        println!(
            "  connect: ok ({})",
            if session.supports_idle() { "IDLE" } else { "polling" }
        );

        let available = session.list_folders().await.unwrap_or_default();
        let folders = supervisor::expand_filters(&provider.folder_filters(), &available)?;
        for folder in folders {
            match session.examine(&folder).await {
                Ok(status) => println!(
                    "  {}: ok (uidvalidity {}, {} messages)",
                    folder, status.generation, status.exists
                ),
                Err(e) => {
                    println!("  {}: FAILED ({})", folder, e);
                    failed += 1;
                }
            }
        }
        session.logout().await;
    }

    if failed > 0 {
        anyhow::bail!("{} check(s) failed", failed);
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    let config = load_config()?;
    let store = Store::open(&config.database_path()?).await?;

    for provider in &config.providers {
        let flag = if provider.enabled { "" } else { " (disabled)" };
        println!("{} / {}{}", provider.tenant, provider.id, flag);

        let states = store.list_folder_states(&provider.id).await?;
        if states.is_empty() {
            println!("  no folder state yet");
        }
        for (folder, state) in states {
            let key = LeaseKey::new(&provider.tenant, &provider.id, &folder);
            let lease = match store.inspect_lease(&key).await? {
                Some(lease) if lease.is_valid() => {
                    format!("leased by {} until {}", lease.owner, lease.expires_at.format("%H:%M:%S"))
                }
                Some(_) => "lease expired".to_string(),
                None => "not leased".to_string(),
            };
            println!(
                "  {}: uidvalidity {} position {} (updated {}), {}",
                folder,
                state.generation,
                state.last_position,
                state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                lease
            );
        }
    }
    Ok(())
}

fn run_set_secret(provider: &str, kind: &str) -> Result<()> {
    use std::io::{self, Write};

    let kind = SecretKind::parse(kind).with_context(|| format!("Unknown secret kind '{}'", kind))?;
    let config = Config::load()?;
    if config.provider(provider).is_none() {
        anyhow::bail!("No provider '{}' in {}", provider, Config::config_path()?.display());
    }

    print!("{} for {}: ", kind, provider);
    io::stdout().flush()?;
    let value = read_secret()?;
    println!();
    if value.is_empty() {
        anyhow::bail!("Empty secret, nothing stored");
    }

    KeyringSecretStore::new().set(provider, kind, &value)?;
    println!("Stored {} for {}.", kind, provider);
    println!("Send SIGHUP to a running instance to pick up the change.");
    Ok(())
}

async fn run_reset(provider: &str, folder: &str) -> Result<()> {
    let config = load_config()?;
    if config.provider(provider).is_none() {
        anyhow::bail!("No provider '{}' configured", provider);
    }
    let store = Store::open(&config.database_path()?).await?;
    store.reset(provider, folder).await?;
    println!("Cursor for {}/{} cleared.", provider, folder);
    Ok(())
}

fn read_secret() -> Result<String> {
    use std::io::{self, IsTerminal};

    let _guard = if io::stdin().is_terminal() {
        Some(DisableEcho::new()?)
    } else {
        None
    };

    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut new = original;
            new.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &new) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let arg = |i: usize| args.get(i).map(|s| s.as_str());

    match arg(1) {
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some("run") => run_service().await,
        Some("check") => run_check().await,
        Some("status") => run_status().await,
        Some("set-secret") => match (arg(2), arg(3)) {
            (Some(provider), Some(kind)) => run_set_secret(provider, kind),
            _ => {
                eprintln!("Usage: inboxd set-secret <provider> <kind>");
                std::process::exit(2);
            }
        },
        Some("reset") => match (arg(2), arg(3)) {
            (Some(provider), Some(folder)) => run_reset(provider, folder).await,
            _ => {
                eprintln!("Usage: inboxd reset <provider> <folder>");
                std::process::exit(2);
            }
        },
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
