//! zar - command line client for the zar analytics API
//!
//! Useful for checking a backend by hand: lease and renew pool numbers,
//! send page and track events, and try the phone number extractor.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Identity database: $XDG_DATA_HOME/zar/identity.db (~/.local/share/zar/identity.db)
//! - Logs: $XDG_STATE_HOME/zar/zar.YYYY-MM-DD.log (~/.local/state/zar/)
//! - Config: $XDG_CONFIG_HOME/zar/config.toml (~/.config/zar/config.toml)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use zar_core::pool::{PoolClient, PoolConfig, PoolManager};
use zar_core::{
    extract, Config, ContextMap, Dom, HttpTransport, IdentityStore, MemoryDom, MemoryElement,
    PageEnv, PoolResult, SqliteStorage, SystemClock, Tracker, Transport,
};

/// Storage scope for identities issued by the CLI
const CLI_SCOPE: &str = "cli";

#[derive(Parser)]
#[command(name = "zar")]
#[command(about = "Visitor analytics and dynamic number insertion client")]
#[command(version)]
struct Args {
    /// API base URL (overrides api.base_url from config)
    #[arg(long, global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the stored visitor, session and client identifiers
    Ids {
        /// Forget stored identifiers first
        #[arg(long)]
        reset: bool,
    },

    /// Request a number from a pool, or renew one
    Lease {
        /// Pool ID
        #[arg(short, long)]
        pool: String,

        /// Number to renew instead of leasing a new one
        #[arg(short, long)]
        number: Option<String>,
    },

    /// Show number pool statistics
    Stats {
        /// Stats key
        #[arg(short, long)]
        key: Option<String>,

        /// Include lease contexts
        #[arg(long)]
        with_contexts: bool,
    },

    /// Send a page event
    Page {
        /// Page URL
        #[arg(short, long)]
        url: String,

        /// Referring URL
        #[arg(long)]
        referrer: Option<String>,

        /// Page title
        #[arg(long)]
        title: Option<String>,

        /// Ask for a number from this pool along with the page view
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Send a track event
    Track {
        /// Event name
        event: String,

        /// Event property as key=value (JSON values are parsed)
        #[arg(long = "prop", value_parser = parse_prop)]
        props: Vec<(String, Value)>,

        /// Page URL the event happened on
        #[arg(short, long, default_value = "")]
        url: String,
    },

    /// Extract the phone number from a piece of text
    Extract {
        /// Element text
        #[arg(short, long)]
        text: String,

        /// Element link target
        #[arg(long)]
        href: Option<String>,
    },

    /// Overlay a leased number on a sample element and keep it renewed
    Watch {
        /// Pool ID
        #[arg(short, long)]
        pool: String,

        /// Text shown before the overlay
        #[arg(short, long)]
        display: String,

        /// Link target of the sample element
        #[arg(long)]
        href: Option<String>,

        /// Renewal interval in seconds (default: from config)
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },
}

/// Parse `key=value`, reading the value as JSON when it is valid JSON.
fn parse_prop(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(api) = &args.api {
        config.api.base_url = Some(api.clone());
    }

    // Initialize logging
    let _log_guard =
        zar_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("zar starting");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(args.command, config))
}

/// HTTP transport and API base URL from config.
fn connect(config: &Config) -> Result<(Arc<dyn Transport>, String)> {
    let base_url = config
        .api
        .base_url()
        .context("no API URL; pass --api or set api.base_url in config.toml")?;
    let transport = HttpTransport::new(config.api.timeout()).context("failed to create HTTP client")?;
    Ok((Arc::new(transport), base_url))
}

async fn run(command: Command, config: Config) -> Result<()> {
    match command {
        Command::Ids { reset } => cmd_ids(&config, reset),
        Command::Extract { text, href } => cmd_extract(&text, href.as_deref()),
        Command::Lease { pool, number } => {
            let (transport, base_url) = connect(&config)?;
            let mut identity = open_identity(&config)?;
            let client = PoolClient::new(transport, &base_url);
            let snapshot = identity.init_ids();
            let response = client
                .request_lease(&pool, number.as_deref(), &ContextMap::new(), &snapshot)
                .await
                .context("lease request failed")?;
            print_json(&response)
        }
        Command::Stats { key, with_contexts } => {
            let (transport, base_url) = connect(&config)?;
            let client = PoolClient::new(transport, &base_url);
            let stats = client
                .fetch_stats(key.as_deref(), with_contexts)
                .await
                .context("failed to fetch pool stats")?;
            print_json(&stats)
        }
        Command::Page {
            url,
            referrer,
            title,
            pool,
        } => {
            let (transport, _) = connect(&config)?;
            let mut identity = open_identity(&config)?;
            let tracker = Tracker::new(transport, &config.api)?;
            let env = PageEnv {
                url,
                referrer,
                title,
                user_agent: Some(user_agent()),
            };
            let pool = pool.map(|id| PoolConfig::new(id, ".phone"));
            let response = tracker
                .page(&mut identity, &env, ContextMap::new(), pool.as_ref())
                .await
                .context("page event failed")?;
            print_json(&response)
        }
        Command::Track { event, props, url } => {
            let (transport, _) = connect(&config)?;
            let mut identity = open_identity(&config)?;
            identity.init_ids();
            let tracker = Tracker::new(transport, &config.api)?;
            let env = PageEnv {
                user_agent: Some(user_agent()),
                ..PageEnv::new(&url)
            };
            tracker
                .track(&identity, &env, &event, props.into_iter().collect())
                .await;
            println!("Sent '{}'", event);
            Ok(())
        }
        Command::Watch {
            pool,
            display,
            href,
            interval,
        } => cmd_watch(&config, pool, display, href, interval).await,
    }
}

fn user_agent() -> String {
    format!("zar-cli/{}", env!("CARGO_PKG_VERSION"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

fn open_identity(config: &Config) -> Result<IdentityStore> {
    let path = Config::identity_db_path();
    let storage = SqliteStorage::open(&path, CLI_SCOPE)
        .with_context(|| format!("failed to open identity database {}", path.display()))?;
    Ok(IdentityStore::new(
        Box::new(storage),
        config.identity.clone(),
        Arc::new(SystemClock),
    ))
}

fn cmd_ids(config: &Config, reset: bool) -> Result<()> {
    let mut identity = open_identity(config)?;
    if reset {
        for kind in zar_core::IdentityKind::ALL {
            identity.reset(kind);
        }
    }
    let snapshot = identity.init_ids();
    print_json(&snapshot)
}

fn sample_element(text: &str, href: Option<&str>) -> MemoryElement {
    let element = MemoryElement::new("a").with_class("phone").with_text(text);
    match href {
        Some(href) => element.with_href(href),
        None => element,
    }
}

fn cmd_extract(text: &str, href: Option<&str>) -> Result<()> {
    let mut dom = MemoryDom::new();
    let el = dom.insert(sample_element(text, href));
    let found = extract(&dom, el);

    println!("Text:        {}", found.text.as_deref().unwrap_or(""));
    println!(
        "Matched:     {}",
        found.number_text.as_deref().unwrap_or("<none>")
    );
    println!("Number:      {}", found.number.as_deref().unwrap_or("<none>"));
    println!("Phone link:  {}", found.href.as_deref().unwrap_or("<none>"));
    Ok(())
}

fn describe(result: &PoolResult) -> String {
    let kind = if result.renew { "renewal" } else { "lease" };
    match (&result.number, &result.msg) {
        (Some(number), _) if result.is_success() => format!("{} ok: {}", kind, number),
        (_, Some(msg)) => format!("{} failed: {}", kind, msg),
        _ => format!("{} failed", kind),
    }
}

async fn cmd_watch(
    config: &Config,
    pool: String,
    display: String,
    href: Option<String>,
    interval: Option<u64>,
) -> Result<()> {
    let (transport, base_url) = connect(config)?;

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let mut dom = MemoryDom::new();
    let el = dom.insert(sample_element(&display, href.as_deref()));

    let mut identity = open_identity(config)?;
    identity.init_ids();
    let clock = Arc::new(SystemClock);
    let mut manager = PoolManager::new(
        Box::new(dom),
        identity,
        PoolClient::new(transport, &base_url),
        clock,
        config.pool.clone(),
    );

    let mut pool_config =
        PoolConfig::new(pool, ".phone").with_observer(|r: &PoolResult| println!("{}", describe(r)));
    if let Some(secs) = interval {
        pool_config = pool_config.with_renewal_interval(Duration::from_secs(secs));
    }

    let result = manager.init_tracking_pool(pool_config, None).await;
    if !result.is_success() {
        bail!(
            "could not lease a number: {}",
            result.msg.as_deref().unwrap_or("unknown error")
        );
    }

    println!(
        "Showing: {}",
        manager.dom().text(el).unwrap_or_default()
    );
    println!("Renewing until Ctrl+C.");

    let shutdown = async {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    manager.run_until(shutdown).await;

    if manager.is_stopped() {
        println!("Renewals stopped after repeated failures");
    }
    manager.clear_all();
    println!(
        "Reverted: {}",
        manager.dom().text(el).unwrap_or_default()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_prop() {
        assert_eq!(
            parse_prop("plan=pro").unwrap(),
            ("plan".to_string(), Value::String("pro".to_string()))
        );
        assert_eq!(
            parse_prop("seats=3").unwrap(),
            ("seats".to_string(), serde_json::json!(3))
        );
        assert!(parse_prop("novalue").is_err());
        assert!(parse_prop("=x").is_err());
    }

    #[test]
    fn test_parse_track_command() {
        let args = Args::try_parse_from([
            "zar",
            "--api",
            "https://api.test/v2",
            "track",
            "signup",
            "--prop",
            "plan=pro",
            "--prop",
            "seats=3",
        ])
        .unwrap();

        assert_eq!(args.api.as_deref(), Some("https://api.test/v2"));
        match args.command {
            Command::Track { event, props, url } => {
                assert_eq!(event, "signup");
                assert_eq!(props.len(), 2);
                assert_eq!(url, "");
            }
            _ => panic!("expected track command"),
        }
    }

    #[test]
    fn test_watch_requires_pool() {
        assert!(Args::try_parse_from(["zar", "watch", "--display", "650-555-1234"]).is_err());
    }

    #[test]
    fn test_watch_rejects_zero_interval() {
        let base = ["zar", "watch", "--pool", "1", "--display", "650-555-1234"];
        assert!(Args::try_parse_from(base.iter().chain(&["--interval", "0"])).is_err());

        let args = Args::try_parse_from(base.iter().chain(&["--interval", "45"])).unwrap();
        match args.command {
            Command::Watch { interval, .. } => assert_eq!(interval, Some(45)),
            _ => panic!("expected watch command"),
        }
    }

    #[test]
    fn test_describe() {
        let mut result = PoolResult::error(Some("1".to_string()), "stopped");
        result.renew = true;
        assert_eq!(describe(&result), "renewal failed: stopped");
    }
}
