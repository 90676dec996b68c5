use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bxconnect_core::{
    ClientOrderId, Config, CredentialsConfig, Mode, OrderEvent, OrderSpec, OrderType, Side,
    SynchronizedClock,
};
use bxconnect_engine::{Connector, ConnectorHandle, EventStream, SimulatedVenue};
use bxconnect_venue::{Authenticator, Credentials, HttpTransport, JsonRestAdapter, Transport};

const API_KEY_ENV: &str = "BXCONNECT_API_KEY";
const API_SECRET_ENV: &str = "BXCONNECT_API_SECRET";

/// bxconnect: order-lifecycle connector for a trading venue
#[derive(Parser)]
#[command(name = "bxconnect", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file.
    CheckConfig {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Measure the venue clock offset.
    ServerTime {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Start the connector and log order events until Ctrl+C.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override the execution mode from the config file.
        #[arg(short, long)]
        mode: Option<ModeArg>,
    },
    /// Place one order and follow it until it is done.
    Place(PlaceArgs),
}

#[derive(Args)]
struct PlaceArgs {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    mode: Option<ModeArg>,

    #[arg(long)]
    pair: String,

    #[arg(long)]
    side: SideArg,

    #[arg(long)]
    price: Decimal,

    #[arg(long)]
    amount: Decimal,

    #[arg(long, default_value = "limit")]
    order_type: OrderTypeArg,

    /// Paper mode only: print a market trade at this price after placing.
    #[arg(long)]
    fill_at: Option<Decimal>,
}

impl PlaceArgs {
    fn spec(&self) -> OrderSpec {
        OrderSpec {
            trading_pair: self.pair.clone(),
            side: self.side.into(),
            order_type: self.order_type.into(),
            price: self.price,
            amount: self.amount,
        }
    }
}

/// CLI-level mode argument, mapped to `bxconnect_core::Mode`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Paper,
    Live,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Paper => Mode::Paper,
            ModeArg::Live => Mode::Live,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(arg: SideArg) -> Self {
        match arg {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderTypeArg {
    Limit,
    LimitMaker,
    Market,
}

impl From<OrderTypeArg> for OrderType {
    fn from(arg: OrderTypeArg) -> Self {
        match arg {
            OrderTypeArg::Limit => OrderType::Limit,
            OrderTypeArg::LimitMaker => OrderType::LimitMaker,
            OrderTypeArg::Market => OrderType::Market,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing with RUST_LOG env filter (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::ServerTime { config } => server_time(&config).await,
        Commands::Run { config, mode } => run(&config, mode).await,
        Commands::Place(args) => place(args).await,
    }
}

/// Read the config, apply CLI and environment overrides, then validate.
fn load_config(path: &Path, mode: Option<ModeArg>) -> Result<Config> {
    let mut config = Config::read(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    if let Some(m) = mode {
        config.mode = m.into();
    }

    let key = std::env::var(API_KEY_ENV).ok();
    let secret = std::env::var(API_SECRET_ENV).ok();
    if key.is_some() || secret.is_some() {
        let creds = config.credentials.get_or_insert_with(|| CredentialsConfig {
            api_key: String::new(),
            api_secret: String::new(),
        });
        if let Some(key) = key {
            creds.api_key = key;
        }
        if let Some(secret) = secret {
            creds.api_secret = secret;
        }
    }

    config
        .validate()
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(config)
}

fn live_transport(
    config: &Config,
    clock: Arc<SynchronizedClock>,
) -> Result<HttpTransport<JsonRestAdapter>> {
    let creds = config
        .credentials
        .as_ref()
        .context("live mode requires [credentials]")?;
    let auth = Authenticator::new(Credentials::from(creds), clock)
        .context("invalid API credentials")?;
    let rest_url = config
        .venue
        .rest_url
        .clone()
        .context("venue.rest_url is required")?;
    let ws_url = config
        .venue
        .ws_url
        .clone()
        .context("venue.ws_url is required")?;

    HttpTransport::new(
        JsonRestAdapter::from_config(config),
        auth,
        rest_url,
        ws_url,
        config.transport.clone(),
    )
    .context("failed to build HTTP transport")
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path, None)?;

    println!("\nvenue:       {}", config.venue.name);
    println!("mode:        {:?}", config.mode);
    println!("trading:     {}", if config.trading_required { "enabled" } else { "disabled" });
    println!(
        "order types: {}",
        config
            .venue
            .order_types
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "polling:     every {:?} ({:?} while stream is down)",
        config.reconciliation.poll_interval(),
        config.reconciliation.stream_down_poll_interval()
    );
    println!(
        "fees:        maker {}% / taker {}%",
        config.fees.maker_percent, config.fees.taker_percent
    );
    println!("\n{:<16} {:>12} {:>12} {:>12}", "Pair", "Min size", "Tick", "Lot");
    println!("{}", "-".repeat(56));
    for pair in &config.trading_pairs {
        println!(
            "{:<16} {:>12} {:>12} {:>12}",
            pair.symbol, pair.min_order_size, pair.price_increment, pair.amount_increment
        );
    }
    println!("\nconfig OK\n");
    Ok(())
}

async fn server_time(path: &Path) -> Result<()> {
    let config = load_config(path, Some(ModeArg::Live))?;
    let clock = Arc::new(SynchronizedClock::new());
    let transport = live_transport(&config, clock.clone())?;

    let sent_at = Utc::now();
    let server = transport
        .request_server_time()
        .await
        .context("server time request failed")?;
    let received_at = Utc::now();
    let offset = clock.add_sample(sent_at, server, received_at);

    println!(
        "\nserver time: {server}\noffset:      {offset} ms\nround trip:  {} ms\n",
        (received_at - sent_at).num_milliseconds()
    );
    transport.close().await;
    Ok(())
}

async fn run(path: &Path, mode: Option<ModeArg>) -> Result<()> {
    let config = load_config(path, mode)?;

    info!("========================================");
    info!("  bxconnect — {}", config.venue.name);
    info!("========================================");
    info!("mode:           {:?}", config.mode);
    info!("pairs:          {}", config.trading_pairs.len());
    info!("poll interval:  {:?}", config.reconciliation.poll_interval());
    info!("========================================");

    let clock = Arc::new(SynchronizedClock::new());
    match config.mode {
        Mode::Paper => {
            let venue = Arc::new(SimulatedVenue::from_config(&config));
            let connector = Connector::new(venue, clock, config)?;
            let mut session = Session::start(connector)?;
            session.follow(None).await;
            session.close().await;
        }
        Mode::Live => {
            let transport = Arc::new(live_transport(&config, clock.clone())?);
            let connector = Connector::new(transport, clock, config)?;
            let mut session = Session::start(connector)?;
            session.follow(None).await;
            session.close().await;
        }
    }

    info!("bxconnect shut down cleanly");
    Ok(())
}

async fn place(args: PlaceArgs) -> Result<()> {
    let config = load_config(&args.config, args.mode)?;
    let spec = args.spec();
    let clock = Arc::new(SynchronizedClock::new());

    match config.mode {
        Mode::Paper => {
            let venue = Arc::new(SimulatedVenue::from_config(&config));
            let connector = Connector::new(venue.clone(), clock, config)?;
            let mut session = Session::start(connector)?;
            let id = session.place(spec.clone()).await?;

            if let Some(price) = args.fill_at {
                let fills = venue.match_at(&spec.trading_pair, price).await;
                info!(price = %price, fills = fills.len(), "simulated market trade");
            }
            session.follow(Some(&id)).await;
            session.close().await;
        }
        Mode::Live => {
            if args.fill_at.is_some() {
                warn!("--fill-at is ignored in live mode");
            }
            let transport = Arc::new(live_transport(&config, clock.clone())?);
            let connector = Connector::new(transport, clock, config)?;
            let mut session = Session::start(connector)?;
            let id = session.place(spec).await?;
            session.follow(Some(&id)).await;
            session.close().await;
        }
    }
    Ok(())
}

/// A started connector plus its event stream.
struct Session<T: Transport> {
    connector: Connector<T>,
    events: EventStream,
    handle: ConnectorHandle<T>,
}

impl<T: Transport> Session<T> {
    fn start(connector: Connector<T>) -> Result<Self> {
        let events = connector
            .events()
            .context("connector event stream already taken")?;
        let handle = connector.start()?;
        Ok(Self {
            connector,
            events,
            handle,
        })
    }

    async fn place(&self, spec: OrderSpec) -> Result<ClientOrderId> {
        let id = self
            .connector
            .place_order(spec)
            .await
            .context("order placement failed")?;
        info!(client_order_id = %id, "order submitted");
        Ok(id)
    }

    /// Log events until `until` reaches a terminal state, the stream ends,
    /// or Ctrl+C. On Ctrl+C a followed order is cancelled first.
    async fn follow(&mut self, until: Option<&ClientOrderId>) {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                maybe_event = self.events.next() => {
                    match maybe_event {
                        Some(event) => {
                            log_event(&event);
                            if until == Some(&event.client_order_id) && event.order.is_terminal() {
                                break;
                            }
                        }
                        None => {
                            info!("event stream ended — shutting down");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("ctrl+c received — shutting down gracefully");
                    if let Some(id) = until {
                        match self.connector.cancel_order(id).await {
                            Ok(ack) => info!(client_order_id = %id, ?ack, "cancel requested"),
                            Err(e) => warn!(client_order_id = %id, error = %e, "cancel failed"),
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn close(self) {
        let orders = self.connector.all_orders().await;
        self.handle.shutdown().await;

        info!("=== Session Summary ===");
        let mut total_filled = Decimal::ZERO;
        let mut total_fees = Decimal::ZERO;
        for order in &orders {
            info!(
                client_order_id = %order.client_order_id,
                pair = %order.trading_pair,
                side = %order.side,
                state = %order.state,
                filled = %order.filled_amount,
                amount = %order.amount,
                avg_price = %order.average_fill_price().unwrap_or_default(),
                fees = %order.fee_paid,
            );
            total_filled += order.filled_quote;
            total_fees += order.fee_paid;
        }
        info!(
            orders = orders.len(),
            filled_quote = %total_filled,
            fees = %total_fees,
            "session complete"
        );
    }
}

fn log_event(event: &OrderEvent) {
    let order = &event.order;
    match &event.trade {
        Some(trade) => info!(
            client_order_id = %event.client_order_id,
            kind = %event.kind,
            trade_id = %trade.trade_id,
            price = %trade.price,
            amount = %trade.amount,
            filled = %order.filled_amount,
            remaining = %order.remaining_amount(),
            "order event"
        ),
        None => info!(
            client_order_id = %event.client_order_id,
            kind = %event.kind,
            state = %order.state,
            exchange_order_id = order.exchange_order_id.as_ref().map_or("-", |x| x.as_str()),
            "order event"
        ),
    }
}
