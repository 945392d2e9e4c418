use clap::{Args, Parser, Subcommand};
use url::Url;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the compute node
    Run {
        #[command(flatten)]
        run_command: Box<RunCmd>,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct RunCmd {
    #[clap(flatten)]
    pub marketplace_args: MarketplaceCliArgs,

    #[clap(flatten)]
    pub gas_args: GasCliArgs,

    #[clap(flatten)]
    pub retry_args: RetryCliArgs,

    #[clap(flatten)]
    pub service_args: ServiceCliArgs,

    #[clap(flatten)]
    pub content_args: ContentStoreCliArgs,

    #[clap(flatten)]
    pub server_args: ServerCliArgs,
}

#[derive(Debug, Clone, Args)]
pub struct MarketplaceCliArgs {
    /// Ordered, comma-separated list of RPC endpoints. The first live one
    /// wins; the rest are failover candidates.
    #[arg(env = "COMPUTE_NODE_RPC_URLS", long = "rpc-urls", value_delimiter = ',', required = true)]
    pub rpc_urls: Vec<Url>,

    /// Chain id of the target network.
    #[arg(env = "COMPUTE_NODE_CHAIN_ID", long, default_value = "31337")]
    pub chain_id: u64,

    /// Private key of the compute-node account.
    #[arg(env = "COMPUTE_NODE_PRIVATE_KEY", long, hide_env_values = true, required = true)]
    pub private_key: String,

    /// Address of the deployed inference marketplace contract.
    #[arg(env = "COMPUTE_NODE_MARKETPLACE_CONTRACT_ADDRESS", long, required = true)]
    pub marketplace_contract_address: String,
}

#[derive(Debug, Clone, Args)]
pub struct GasCliArgs {
    /// Floor for the priority fee, in wei.
    #[arg(env = "COMPUTE_NODE_MIN_PRIORITY_FEE_WEI", long, default_value = "1500000000")]
    pub min_priority_fee_wei: u128,

    /// Starting point for the legacy flat-price fallback, in wei.
    #[arg(env = "COMPUTE_NODE_MIN_GAS_PRICE_WEI", long, default_value = "1000000000")]
    pub min_gas_price_wei: u128,

    /// Ceiling for any fee component, in wei.
    #[arg(env = "COMPUTE_NODE_MAX_GAS_PRICE_WEI", long, default_value = "500000000000")]
    pub max_gas_price_wei: u128,

    /// Per-attempt fee multiplier; must be greater than 1.
    #[arg(env = "COMPUTE_NODE_FEE_INCREASE_FACTOR", long, default_value = "1.25")]
    pub fee_increase_factor: f64,

    /// Percentage bump for same-nonce replacement transactions; at least 30.
    #[arg(env = "COMPUTE_NODE_REPLACEMENT_BUMP_PERCENT", long, default_value = "30")]
    pub replacement_bump_percent: u32,

    /// Gas limit applied to marketplace transactions.
    #[arg(env = "COMPUTE_NODE_GAS_LIMIT", long, default_value = "500000")]
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Args)]
pub struct RetryCliArgs {
    /// Transaction attempts per endpoint before failing over.
    #[arg(env = "COMPUTE_NODE_TX_MAX_ATTEMPTS", long, default_value = "5")]
    pub tx_max_attempts: u32,

    /// Base delay of the exponential backoff between attempts, in ms.
    #[arg(env = "COMPUTE_NODE_TX_BASE_DELAY_MS", long, default_value = "1000")]
    pub tx_base_delay_ms: u64,

    /// Cap on the backoff delay, in ms.
    #[arg(env = "COMPUTE_NODE_TX_MAX_DELAY_MS", long, default_value = "30000")]
    pub tx_max_delay_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ServiceCliArgs {
    /// Interval of the pending-request polling sweep, in seconds.
    #[arg(env = "COMPUTE_NODE_POLLING_INTERVAL_SECS", long, default_value = "30")]
    pub polling_interval_secs: u64,

    /// Maximum number of requests processed concurrently.
    #[arg(env = "COMPUTE_NODE_MAX_CONCURRENT_REQUESTS", long, default_value = "5")]
    pub max_concurrent_requests: usize,

    /// Timeout for one model inference, in seconds.
    #[arg(env = "COMPUTE_NODE_INFERENCE_TIMEOUT_SECS", long, default_value = "30")]
    pub inference_timeout_secs: u64,

    /// How long shutdown waits for in-flight requests, in seconds.
    #[arg(env = "COMPUTE_NODE_DRAIN_TIMEOUT_SECS", long, default_value = "30")]
    pub drain_timeout_secs: u64,

    /// TTL of indexed request cache entries, in seconds.
    #[arg(env = "COMPUTE_NODE_CACHE_TTL_SECS", long, default_value = "300")]
    pub cache_ttl_secs: u64,

    /// Maximum age of the last backfill before maintenance re-runs it.
    #[arg(env = "COMPUTE_NODE_BACKFILL_INTERVAL_SECS", long, default_value = "60")]
    pub backfill_interval_secs: u64,

    /// Interval of the indexer maintenance task, in seconds.
    #[arg(env = "COMPUTE_NODE_MAINTENANCE_INTERVAL_SECS", long, default_value = "30")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ContentStoreCliArgs {
    /// Gateway used to fetch input payloads by content hash.
    #[arg(env = "COMPUTE_NODE_CONTENT_GATEWAY_URL", long, default_value = "https://ipfs.io/")]
    pub content_gateway_url: Url,

    /// Optional add API used to publish result payloads.
    #[arg(env = "COMPUTE_NODE_CONTENT_API_URL", long)]
    pub content_api_url: Option<Url>,
}

#[derive(Debug, Clone, Args)]
pub struct ServerCliArgs {
    #[arg(env = "COMPUTE_NODE_SERVER_HOST", long = "server-host", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(env = "COMPUTE_NODE_SERVER_PORT", long = "server-port", default_value = "3000")]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_ARGS: &[&str] = &[
        "compute-node",
        "run",
        "--rpc-urls",
        "http://localhost:8545,http://localhost:8546",
        "--private-key",
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        "--marketplace-contract-address",
        "0x5FbDB2315678afecb367f032d93F642f64180aa3",
    ];

    #[test]
    fn run_command_parses_with_defaults() {
        let cli = Cli::try_parse_from(BASE_ARGS).unwrap();
        let Commands::Run { run_command } = cli.command;
        assert_eq!(run_command.marketplace_args.rpc_urls.len(), 2);
        assert_eq!(run_command.service_args.polling_interval_secs, 30);
        assert_eq!(run_command.retry_args.tx_max_attempts, 5);
        assert_eq!(run_command.gas_args.replacement_bump_percent, 30);
        assert_eq!(run_command.server_args.port, 3000);
    }

    #[test]
    fn missing_private_key_is_rejected() {
        let args: Vec<&str> = BASE_ARGS
            .iter()
            .copied()
            .filter(|a| *a != "--private-key" && !a.starts_with("0xac09"))
            .collect();
        assert!(Cli::try_parse_from(args).is_err());
    }
}
