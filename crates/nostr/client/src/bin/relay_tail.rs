use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr::{Event, Filter, RelayUrl};
use nostr_relay_client::{
    ClientConfig, CountListener, NostrClient, RequestListener, TungsteniteSocketBuilder,
};
use tokio::sync::Notify;
use tracing::{info, warn};

const SUBSCRIPTION_ID: &str = "tail";
const COUNT_ID: &str = "tail-count";

#[derive(Parser, Debug)]
#[command(name = "nostr-relay-tail")]
#[command(about = "Stream matching events from one or more Nostr relays as JSON lines")]
struct Args {
    /// Relay URLs, e.g. wss://relay.damus.io
    #[arg(required = true)]
    relays: Vec<String>,
    /// Event kinds to match (comma separated).
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<u16>,
    /// Author pubkeys to match (comma separated hex).
    #[arg(long, value_delimiter = ',')]
    authors: Vec<String>,
    /// Stored events to ask each relay for.
    #[arg(long, default_value_t = 20)]
    limit: u64,
    /// Also ask each relay how many events match (NIP-45).
    #[arg(long)]
    count: bool,
    /// Exit once every relay finished sending stored events.
    #[arg(long)]
    until_eose: bool,
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
}

impl Args {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.clone());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.clone());
        }
        filter
    }
}

/// Prints events and counts, and tracks which relays are done replaying.
struct Printer {
    pending: Mutex<HashSet<RelayUrl>>,
    done: Notify,
}

impl Printer {
    fn new(relays: &HashSet<RelayUrl>) -> Self {
        Self {
            pending: Mutex::new(relays.clone()),
            done: Notify::new(),
        }
    }

    fn finish(&self, relay: &RelayUrl) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.remove(relay) && pending.is_empty() {
            self.done.notify_one();
        }
    }

    fn emit(&self, line: &serde_json::Value) {
        let mut stdout = std::io::stdout().lock();
        if let Err(error) = writeln!(stdout, "{}", line) {
            warn!("cannot write to stdout: {}", error);
        }
    }
}

impl RequestListener for Printer {
    fn on_event(
        &self,
        relay: &RelayUrl,
        event: &Event,
        is_live: bool,
        _filters: Option<&[Filter]>,
    ) {
        self.emit(&serde_json::json!({
            "relay": relay,
            "live": is_live,
            "event": event,
        }));
    }

    fn on_eose(&self, relay: &RelayUrl, _filters: Option<&[Filter]>) {
        info!("{} finished stored events", relay);
        self.finish(relay);
    }

    fn on_closed(&self, relay: &RelayUrl, message: &str, _filters: Option<&[Filter]>) {
        warn!("{} closed the subscription: {}", relay, message);
        self.finish(relay);
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, message: &str, _filters: Option<&[Filter]>) {
        warn!("cannot connect to {}: {}", relay, message);
        self.finish(relay);
    }
}

impl CountListener for Printer {
    fn on_count(&self, relay: &RelayUrl, count: u64, _filters: Option<&[Filter]>) {
        self.emit(&serde_json::json!({ "relay": relay, "count": count }));
    }

    fn on_closed(&self, relay: &RelayUrl, message: &str) {
        warn!("{} refused COUNT: {}", relay, message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let relays = args
        .relays
        .iter()
        .map(|relay| RelayUrl::parse(relay).with_context(|| format!("invalid relay url {relay}")))
        .collect::<Result<HashSet<_>>>()?;

    let builder = TungsteniteSocketBuilder::current()?
        .with_connect_timeout(Duration::from_secs(args.connect_timeout_secs));
    let client = NostrClient::new(Arc::new(builder), ClientConfig::from_env())?;
    client.connect();

    let printer = Arc::new(Printer::new(&relays));
    let filters: HashMap<RelayUrl, Vec<Filter>> = relays
        .iter()
        .map(|relay| (relay.clone(), vec![args.filter().limit(args.limit)]))
        .collect();
    info!("tailing {} relays", relays.len());
    let events: Arc<dyn RequestListener> = printer.clone();
    client.open_req_subscription(SUBSCRIPTION_ID, filters, Some(events));

    if args.count {
        let counts = relays
            .iter()
            .map(|relay| (relay.clone(), vec![args.filter()]))
            .collect();
        let totals: Arc<dyn CountListener> = printer.clone();
        client.query_count(COUNT_ID, counts, Some(totals));
    }

    if args.until_eose {
        tokio::select! {
            () = printer.done.notified() => {}
            result = tokio::signal::ctrl_c() => result.context("wait for ctrl-c")?,
        }
    } else {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    }

    client.close(SUBSCRIPTION_ID);
    client.close(COUNT_ID);
    client.disconnect();
    Ok(())
}
