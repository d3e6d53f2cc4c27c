use chrono::Local;
use clap::{Parser, Subcommand};
use stockx_scrap::{
    info_time, BidsAsksQuery, Config, FetchOutcome, PriceLevelsQuery, ProductsQuery, Response,
    Result, StockxScraper, START_PAGE,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "stockx-scrap")]
#[command(about = "Scrape StockX browse listings, order books and sales", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Browse the product catalog
    Products {
        /// Products per page
        #[arg(long, default_value_t = 15)]
        limit: usize,

        #[arg(long, default_value_t = START_PAGE)]
        start_page: usize,

        /// Stop once this page index is reached
        #[arg(long)]
        stop_page: Option<usize>,

        /// Skip per-variant market data
        #[arg(long)]
        light: bool,
    },

    /// Browse products with one side of their order book
    BidsAsks {
        /// BID or ASK
        transaction_type: String,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Price levels per product
        #[arg(long, default_value_t = 50)]
        transaction_type_limit: usize,

        #[arg(long, default_value_t = START_PAGE)]
        start_page: usize,

        #[arg(long)]
        stop_page: Option<usize>,
    },

    /// Order book levels of a single product or variant
    PriceLevels {
        product_id: String,

        /// BID or ASK
        #[arg(long, default_value = "BID")]
        transaction_type: String,

        /// Treat the id as a variant id
        #[arg(long)]
        variant: bool,

        #[arg(long, default_value_t = START_PAGE)]
        page: usize,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Latest sales of a product
    Sales {
        url_key: String,

        product_id: String,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "stockx_scrap=debug"
    } else {
        "stockx_scrap=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let start_time = Local::now();
    let config = Config::from_env().await?;
    info!(
        rotation = config.rotation.enabled,
        proxies = config.proxies.len(),
        "Configuration loaded"
    );
    let mut scraper = StockxScraper::from_config(&config)?;

    let ok = match cli.command {
        Commands::Products {
            limit,
            start_page,
            stop_page,
            light,
        } => {
            let query = ProductsQuery {
                limit,
                start_page,
                stop_page,
                light,
                ..ProductsQuery::default()
            };
            print_outcome(scraper.fetch_products(&query).await)?
        }
        Commands::BidsAsks {
            transaction_type,
            limit,
            transaction_type_limit,
            start_page,
            stop_page,
        } => {
            let query = BidsAsksQuery {
                limit,
                transaction_type_limit,
                start_page,
                stop_page,
            };
            print_outcome(scraper.fetch_bids_asks(&transaction_type, &query).await)?
        }
        Commands::PriceLevels {
            product_id,
            transaction_type,
            variant,
            page,
            limit,
        } => {
            let query = PriceLevelsQuery {
                is_variant: variant,
                page,
                limit,
                ..PriceLevelsQuery::new(product_id, transaction_type.parse()?)
            };
            print_response(scraper.fetch_product_price_levels(&query).await?)
        }
        Commands::Sales {
            url_key,
            product_id,
            limit,
        } => print_response(
            scraper
                .fetch_product_sales(&url_key, &product_id, limit)
                .await?,
        ),
    };

    info_time!(start_time, "Full program time:");
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn print_outcome(outcome: FetchOutcome) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(&outcome.items)?);
    if !outcome.is_success() {
        error!(page = outcome.page, status = ?outcome.status, "Fetch stopped early");
    }
    Ok(outcome.is_success())
}

fn print_response(res: Response) -> bool {
    println!("{}", res.body);
    res.is_ok()
}
