use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fututrader::auth::{md5_hex, Password};
use fututrader::config::AppConfig;
use fututrader::gateway::{GatewayConnection, PaperGateway, TcpTransport, Transport};
use fututrader::session::{SessionConfig, TradingSession};
use fututrader::strategy::{StrategyParams, StrategyRegistry};
use std::future::Future;
use std::process::ExitCode;
use tokio::sync::watch;

const KLINE_PREVIEW: usize = 5;
const BOOK_DEPTH: usize = 5;

#[derive(Parser)]
#[command(name = "fututrader")]
#[command(about = "Trading client for the Futu OpenD gateway", long_about = None)]
struct Cli {
    /// Use the in-process paper gateway instead of OpenD
    #[arg(long, global = true)]
    paper: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a market snapshot, then quote, recent K-lines and top of book per symbol
    Quote {
        /// Symbols, e.g. "HK.00700" or "00700" (prefixed with DEFAULT_MARKET)
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Show accounts, funds, positions and open orders
    Account,
    /// Run a strategy until Ctrl-C
    Strategy {
        /// Strategy identifier ("sma", "ema")
        name: String,
        symbol: String,
        #[arg(long, default_value_t = 10)]
        short_window: usize,
        #[arg(long, default_value_t = 30)]
        long_window: usize,
    },
    /// Print the MD5 digest of a password for IS_PASSWORD_HASHED=True setups
    HashPwd { password: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fututrader=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::HashPwd { password } = &cli.command {
        println!("MD5 hash: {}", hash_password(password)?);
        println!("Set IS_PASSWORD_HASHED=True in .env to use it as a configured password");
        return Ok(());
    }

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if cli.paper && config.credentials.account_id.is_empty() {
        // The paper gateway accepts any login
        config.credentials.account_id = "PAPER-1".to_string();
        config.credentials.account_pwd = Password::new("paper", false);
    }
    let gateway = build_gateway(&config, cli.paper);

    match cli.command {
        Commands::Quote { symbols } => {
            let symbols: Vec<String> = symbols.iter().map(|s| config.market.qualify(s)).collect();
            with_connection(&gateway, &config, show_quote(&gateway, &symbols)).await
        }
        Commands::Account => with_connection(&gateway, &config, show_account(&gateway)).await,
        Commands::Strategy {
            name,
            symbol,
            short_window,
            long_window,
        } => {
            let symbol = config.market.qualify(&symbol);
            let params = StrategyParams {
                short_window,
                long_window,
            };
            run_strategy(gateway, &config, &name, &symbol, &params).await
        }
        Commands::HashPwd { .. } => Ok(()),
    }
}

fn hash_password(password: &str) -> Result<String> {
    if password.trim().is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    Ok(md5_hex(password))
}

fn build_gateway(config: &AppConfig, paper: bool) -> GatewayConnection {
    let transport: Box<dyn Transport> = if paper {
        tracing::info!("📝 Paper mode: using the in-process simulated gateway");
        Box::new(PaperGateway::new())
    } else {
        Box::new(TcpTransport::new())
    };
    GatewayConnection::new(transport, config.gateway.clone(), config.trading_env)
}

/// Connect, authenticate and run `work`, releasing the connection whatever the outcome
async fn with_connection<F>(gateway: &GatewayConnection, config: &AppConfig, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = match open_session(gateway, config).await {
        Ok(()) => work.await,
        Err(e) => Err(e),
    };
    gateway.disconnect().await;
    result
}

async fn open_session(gateway: &GatewayConnection, config: &AppConfig) -> Result<()> {
    gateway
        .connect()
        .await
        .with_context(|| format!("Failed to connect to gateway at {}", gateway.endpoint()))?;
    gateway
        .authenticate(&config.credentials)
        .await
        .context("Failed to authenticate with gateway")?;
    Ok(())
}

async fn show_quote(gateway: &GatewayConnection, symbols: &[String]) -> Result<()> {
    let rows = gateway
        .market_snapshot(symbols)
        .await
        .context("Failed to fetch market snapshot")?;
    println!("\n📸 Market snapshot");
    println!(
        "  {:<12} {:>10} {:>10} {:>8} {:>12} {:>6}",
        "Symbol", "Last", "Prev", "Chg%", "Volume", "Lot"
    );
    for row in &rows {
        println!(
            "  {:<12} {:>10.3} {:>10.3} {:>7.2}% {:>12.0} {:>6}{}",
            row.symbol,
            row.last_price,
            row.prev_close_price,
            row.change_rate(),
            row.volume,
            row.lot_size,
            if row.suspended { "  (suspended)" } else { "" }
        );
    }

    for symbol in symbols {
        show_symbol(gateway, symbol).await?;
    }
    Ok(())
}

async fn show_symbol(gateway: &GatewayConnection, symbol: &str) -> Result<()> {
    let quote = gateway.quote(symbol).await.context("Failed to fetch quote")?;
    println!("\n📊 {}", quote.symbol);
    println!("  Last:       {:.3}", quote.last_price);
    println!("  Open:       {:.3}", quote.open_price);
    println!("  High/Low:   {:.3} / {:.3}", quote.high_price, quote.low_price);
    println!("  Prev close: {:.3}", quote.prev_close_price);
    println!("  Volume:     {:.0}", quote.volume);
    println!("  Turnover:   {:.0}", quote.turnover);
    println!("  Updated:    {}", quote.timestamp);

    match gateway.klines(symbol, KLINE_PREVIEW).await {
        Ok(bars) => {
            println!("\n🕯️  Last {} K-lines", bars.len());
            for bar in bars {
                println!(
                    "  {}  O {:.3}  H {:.3}  L {:.3}  C {:.3}  V {:.0}",
                    bar.timestamp, bar.open, bar.high, bar.low, bar.close, bar.volume
                );
            }
        }
        Err(e) => tracing::warn!("Failed to fetch K-lines: {}", e),
    }

    match gateway.order_book(symbol, BOOK_DEPTH).await {
        Ok(book) => {
            println!("\n📖 Order book");
            for (bid, ask) in book.bids.iter().zip(book.asks.iter()) {
                println!(
                    "  {:>10.3} x {:<8.0} | {:>10.3} x {:<8.0}",
                    bid.price, bid.volume, ask.price, ask.volume
                );
            }
        }
        Err(e) => tracing::warn!("Failed to fetch order book: {}", e),
    }
    Ok(())
}

async fn show_account(gateway: &GatewayConnection) -> Result<()> {
    let accounts = gateway.accounts().await.context("Failed to list accounts")?;
    println!("\n👤 Accounts");
    for account in accounts {
        println!(
            "  {}  {}  {}",
            account.account_id, account.trading_env, account.account_type
        );
    }

    let funds = gateway
        .account_info()
        .await
        .context("Failed to fetch account funds")?;
    println!("\n💰 Funds ({})", funds.currency);
    println!("  Buying power: {:.2}", funds.power);
    println!("  Total assets: {:.2}", funds.total_assets);
    println!("  Cash:         {:.2}", funds.cash);
    println!("  Market value: {:.2}", funds.market_value);

    let positions = gateway.positions().await.context("Failed to fetch positions")?;
    println!("\n📦 Positions");
    if positions.is_empty() {
        println!("  (none)");
    }
    for position in positions {
        println!(
            "  {:<12} {:>8} @ {:.3}",
            position.symbol, position.quantity, position.average_cost
        );
    }

    let orders = gateway.orders().await.context("Failed to fetch orders")?;
    println!("\n📝 Open orders");
    if orders.is_empty() {
        println!("  (none)");
    }
    for order in orders {
        println!(
            "  {}  {:<12} {} {:>8}  {:?}",
            order.order_id, order.symbol, order.side, order.quantity, order.status
        );
    }
    Ok(())
}

async fn run_strategy(
    gateway: GatewayConnection,
    config: &AppConfig,
    name: &str,
    symbol: &str,
    params: &StrategyParams,
) -> Result<()> {
    let registry = StrategyRegistry::new();
    let strategy = registry
        .create(name, params)
        .with_context(|| format!("Available strategies: {}", registry.identifiers().join(", ")))?;

    let mut session = TradingSession::new(
        gateway,
        config.credentials.clone(),
        config.ledger.clone(),
        SessionConfig::from_app(config),
    );
    session.add_symbol(symbol, strategy);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = session.run(shutdown_rx).await?;

    tracing::info!("\n📊 Session summary:");
    tracing::info!("  Ticks: {}", report.ticks);
    tracing::info!("  Orders submitted: {}", report.orders_submitted);
    tracing::info!("  Orders rejected: {}", report.orders_rejected);
    tracing::info!("  Reconnects: {}", report.reconnects);
    for position in &report.positions {
        tracing::info!(
            "  Position {}: {} @ {:.3}",
            position.symbol,
            position.quantity,
            position.average_cost
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fututrader::config::GatewaySettings;
    use fututrader::TradingEnv;

    fn paper_config() -> AppConfig {
        AppConfig::from_pairs([
            ("FUTU_ACCOUNT_ID", "PAPER-1"),
            ("FUTU_ACCOUNT_PWD", "paper"),
        ])
        .unwrap()
    }

    fn paper_gateway(paper: &PaperGateway) -> GatewayConnection {
        GatewayConnection::new(
            Box::new(paper.clone()),
            GatewaySettings::default(),
            TradingEnv::Simulate,
        )
    }

    #[test]
    fn test_empty_password_not_hashed() {
        assert!(hash_password("").is_err());
        assert!(hash_password("   ").is_err());
        assert_eq!(
            hash_password("123456").unwrap(),
            "e10adc3949ba59abbe56e057f20f883e"
        );
    }

    #[tokio::test]
    async fn test_failed_command_still_disconnects() {
        let paper = PaperGateway::new();
        let gateway = paper_gateway(&paper);

        let result = with_connection(&gateway, &paper_config(), async {
            Err(anyhow::anyhow!("funds query failed"))
        })
        .await;

        assert!(result.is_err());
        assert!(!paper.is_open());
    }

    #[tokio::test]
    async fn test_failed_login_still_disconnects() {
        let paper = PaperGateway::new();
        paper.expect_login_password("something-else");
        let gateway = paper_gateway(&paper);

        let result = with_connection(&gateway, &paper_config(), async { Ok(()) }).await;

        assert!(result.is_err());
        assert!(!paper.is_open());
    }

    #[tokio::test]
    async fn test_quote_for_several_symbols() {
        let paper = PaperGateway::with_seed(3);
        let gateway = paper_gateway(&paper);
        let symbols = vec!["HK.00700".to_string(), "US.AAPL".to_string()];

        let result = with_connection(&gateway, &paper_config(), show_quote(&gateway, &symbols)).await;
        assert!(result.is_ok());
        assert!(!paper.is_open());
    }
}
