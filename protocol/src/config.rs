//! # Protocol Configuration & Constants
//!
//! Every magic number lives here, next to the TOML schema the node binary
//! loads. The constants are the canonical values; the `*Config` structs
//! default to them and let an operator override the ones that are safe to
//! tune per deployment (intervals, limits, paths). Consensus-critical values
//! such as the slot length must match across the whole network, so changing
//! them is a new chain, not a config tweak.

use std::path::{Path, PathBuf};
use std::time::Duration;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::Address;

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Length of a slot. Exactly one proposer may mint per slot.
pub const BLOCK_INTERVAL_MS: u64 = 15_000;

/// Length of a dynasty window. `serial(t)` counts these since genesis.
pub const DYNASTY_INTERVAL_MS: u64 = 3_600_000;

/// Miners per dynasty in the canonical configuration.
pub const DYNASTY_SIZE: usize = 21;

/// Upper bound on how long before a slot we start assembling its block.
pub const MAX_MINT_DURATION_MS: u64 = 5_250;

/// Below this much time before the slot there is not enough room to mint.
pub const MIN_MINT_DURATION_MS: u64 = 2_250;

/// The mint loop wakes up this often.
pub const MINT_TICK: Duration = Duration::from_secs(1);

/// Dynasties kept in memory, keyed by serial.
pub const DYNASTY_CACHE_SIZE: usize = 128;

/// First height whose header must carry a VRF seed and proof.
pub const DEFAULT_VRF_ACTIVATION_HEIGHT: u64 = 2;

/// How far back the VRF ancestor sits from the block being minted.
pub const VRF_ANCESTOR_DISTANCE: u64 = 2;

/// Slots remembered for double-mint detection.
pub const DOUBLE_MINT_CACHE_SIZE: usize = 1_024;

/// Minimum witnesses, or distinct proposers, needed to make a block
/// irreversible: `2·size/3 + 1`.
pub const fn consensus_size(dynasty_size: usize) -> usize {
    dynasty_size * 2 / 3 + 1
}

// ---------------------------------------------------------------------------
// Chain & transactions
// ---------------------------------------------------------------------------

/// Genesis block height. Heights count from one.
pub const GENESIS_HEIGHT: u64 = 1;

/// Decoded blocks kept in memory by the blockchain.
pub const BLOCK_CACHE_SIZE: usize = 1_024;

/// Orphan blocks parked in the block pool waiting for their parent.
pub const ORPHAN_BLOCK_CACHE_SIZE: usize = 256;

/// Transactions held by the pool before the cheapest get evicted.
pub const TX_POOL_SIZE: usize = 40_960;

/// Floor for the gas price a pool will accept.
pub const MIN_GAS_PRICE: u64 = 1_000_000;

/// Ceiling for a single transaction's gas limit.
pub const MAX_GAS_LIMIT: u64 = 50_000_000_000;

/// Gas charged for a native transfer or heartbeat.
pub const TRANSFER_GAS: u64 = 20_000;

/// Maximum payload size accepted by the pool.
pub const MAX_TX_PAYLOAD_BYTES: usize = 128 * 1024;

/// Default parallelism for transaction execution.
pub const DEFAULT_EXECUTION_CONCURRENCY: usize = 8;

// ---------------------------------------------------------------------------
// Wire & P2P
// ---------------------------------------------------------------------------

/// "NEB1": first four bytes of every frame.
pub const MESSAGE_MAGIC: u32 = 0x4E45_4231;

/// Fixed frame header size.
pub const MESSAGE_HEADER_LENGTH: usize = 36;

/// Largest payload a frame may carry.
pub const MAX_MESSAGE_DATA_LENGTH: usize = 32 * 1024 * 1024;

/// Longest message name that fits the header.
pub const MAX_MESSAGE_NAME_LENGTH: usize = 12;

/// Frame format version written by this node.
pub const DEFAULT_MESSAGE_VERSION: u8 = 0;

/// Client version exchanged in HELLO/OK. Must match exactly.
pub const CLIENT_VERSION: &str = "0.1.0";

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const STREAM_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// A handshaken stream with no inbound traffic for this long is idle.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Capacity of each of the three per-stream send queues.
pub const STREAM_QUEUE_CAPACITY: usize = 1_024;

pub const DEFAULT_MAX_STREAMS: usize = 200;

pub const ROUTE_TABLE_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const ROUTE_TABLE_SAVE_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_BUCKET_SIZE: usize = 64;
pub const DEFAULT_MAX_SYNC_NODES: usize = 64;
pub const MAX_PEERS_COUNT_FOR_SYNC_RESP: usize = 32;

/// Bloom filter geometry for recv de-duplication: ~1% false positives at
/// 100k entries.
pub const RECV_FILTER_BITS: usize = 1_437_759;
pub const RECV_FILTER_HASHES: u32 = 10;
pub const RECV_FILTER_RESET_COUNT: usize = 100_000;

/// Inbound messages buffered in the net dispatcher.
pub const DISPATCHER_QUEUE_CAPACITY: usize = 8_192;

/// Checksums remembered per gossip name for dispatcher de-duplication.
pub const DISPATCHER_DEDUP_CACHE_SIZE: usize = 4_096;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

pub const CHUNK_SIZE: usize = 32;
pub const MAX_CHUNK_PER_SYNC_REQUEST: usize = 10;
pub const CONCURRENT_SYNC_CHUNK_DATA_COUNT: usize = 10;
pub const CHUNK_DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to collect `ChainChunks` answers before voting on them.
pub const SYNC_RESPONSE_WINDOW: Duration = Duration::from_secs(5);

/// Resends of a single chunk before the round is abandoned.
pub const MAX_CHUNK_RETRIES: usize = 5;

// ---------------------------------------------------------------------------
// Persistable cache
// ---------------------------------------------------------------------------

pub const PERSIST_CACHE_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Node configuration file
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root of the TOML file handed to the node binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub network: NetworkConfig,
    pub consensus: ConsensusConfig,
    pub genesis: GenesisConfig,
    pub log: LogConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u32,
    pub datadir: PathBuf,
    /// Hex secret key of the miner. Without it the node only validates.
    pub miner_key: Option<String>,
    /// Where block rewards and fees go. Defaults to the miner address.
    pub coinbase: Option<Address>,
    pub enable_mint: bool,
    pub execution_concurrency: usize,
    pub tx_pool_size: usize,
    pub block_reward: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 100,
            datadir: PathBuf::from("data.db"),
            miner_key: None,
            coinbase: None,
            enable_mint: false,
            execution_concurrency: DEFAULT_EXECUTION_CONCURRENCY,
            tx_pool_size: TX_POOL_SIZE,
            block_reward: "0".to_string(),
        }
    }
}

impl ChainConfig {
    pub fn block_reward(&self) -> Result<U256, ConfigError> {
        U256::from_dec_str(&self.block_reward)
            .map_err(|e| ConfigError::Invalid(format!("block_reward: {e:?}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen: Vec<String>,
    pub seeds: Vec<String>,
    /// File holding the node identity key. Created on first start.
    pub private_key: PathBuf,
    pub route_table_cache: PathBuf,
    pub internal_node_list: Option<PathBuf>,
    pub client_version: String,
    pub bucket_size: usize,
    pub max_streams: usize,
    pub max_sync_nodes: usize,
    pub max_peers_count_for_sync_resp: usize,
    pub route_table_sync_interval_secs: u64,
    pub route_table_save_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: vec!["/ip4/0.0.0.0/tcp/8680".to_string()],
            seeds: Vec::new(),
            private_key: PathBuf::from("network.key"),
            route_table_cache: PathBuf::from("routetable.cache"),
            internal_node_list: None,
            client_version: CLIENT_VERSION.to_string(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            max_sync_nodes: DEFAULT_MAX_SYNC_NODES,
            max_peers_count_for_sync_resp: MAX_PEERS_COUNT_FOR_SYNC_RESP,
            route_table_sync_interval_secs: ROUTE_TABLE_SYNC_INTERVAL.as_secs(),
            route_table_save_interval_secs: ROUTE_TABLE_SAVE_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub block_interval_ms: u64,
    pub dynasty_interval_ms: u64,
    pub dynasty_size: usize,
    pub max_mint_duration_ms: u64,
    pub min_mint_duration_ms: u64,
    pub vrf_activation_height: u64,
    /// Contract answering `PoDMiners(serial)` and `PoDParticipants()`.
    pub dynasty_contract: Option<Address>,
    /// Directory of the minted-slot journal.
    pub mint_journal_dir: Option<PathBuf>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: BLOCK_INTERVAL_MS,
            dynasty_interval_ms: DYNASTY_INTERVAL_MS,
            dynasty_size: DYNASTY_SIZE,
            max_mint_duration_ms: MAX_MINT_DURATION_MS,
            min_mint_duration_ms: MIN_MINT_DURATION_MS,
            vrf_activation_height: DEFAULT_VRF_ACTIVATION_HEIGHT,
            dynasty_contract: None,
            mint_journal_dir: None,
        }
    }
}

impl ConsensusConfig {
    pub fn consensus_size(&self) -> usize {
        consensus_size(self.dynasty_size)
    }

    /// Slot length in whole seconds.
    pub fn block_interval_secs(&self) -> u64 {
        self.block_interval_ms / 1000
    }
}

/// One genesis balance. The value is a decimal string so it can exceed
/// TOML's 64-bit integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: Address,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub chain_id: u32,
    /// Seconds. Must be a multiple of the slot length.
    pub timestamp: u64,
    pub dynasty: Vec<Address>,
    pub distribution: Vec<GenesisAllocation>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: 100,
            timestamp: 0,
            dynasty: Vec::new(),
            distribution: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// `host:port` for the Prometheus endpoint. Disabled when absent.
    pub metrics_listen: Option<String>,
}

impl NodeConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the node cannot run with. Everything here is
    /// a fatal startup error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.consensus;
        if c.block_interval_ms == 0 || c.block_interval_ms % 1000 != 0 {
            return Err(ConfigError::Invalid(
                "block_interval_ms must be a positive multiple of 1000".into(),
            ));
        }
        if c.dynasty_interval_ms < c.block_interval_ms {
            return Err(ConfigError::Invalid(
                "dynasty_interval_ms shorter than a slot".into(),
            ));
        }
        if c.min_mint_duration_ms >= c.max_mint_duration_ms {
            return Err(ConfigError::Invalid(
                "min_mint_duration_ms must be below max_mint_duration_ms".into(),
            ));
        }
        if self.genesis.chain_id != self.chain.chain_id {
            return Err(ConfigError::Invalid(format!(
                "chain id {} does not match genesis chain id {}",
                self.chain.chain_id, self.genesis.chain_id
            )));
        }
        if self.genesis.dynasty.is_empty() {
            return Err(ConfigError::Invalid("genesis dynasty is empty".into()));
        }
        if self.genesis.dynasty.len() != c.dynasty_size {
            return Err(ConfigError::Invalid(format!(
                "genesis dynasty has {} members, expected {}",
                self.genesis.dynasty.len(),
                c.dynasty_size
            )));
        }
        if self.genesis.timestamp % c.block_interval_secs() != 0 {
            return Err(ConfigError::Invalid(
                "genesis timestamp is not aligned to a slot".into(),
            ));
        }
        for alloc in &self.genesis.distribution {
            U256::from_dec_str(&alloc.value).map_err(|e| {
                ConfigError::Invalid(format!("genesis value for {}: {e:?}", alloc.address))
            })?;
        }
        self.chain.block_reward()?;
        if self.chain.execution_concurrency == 0 {
            return Err(ConfigError::Invalid("execution_concurrency must be > 0".into()));
        }
        if self.network.bucket_size == 0 {
            return Err(ConfigError::Invalid("bucket_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynasty_toml(n: usize) -> String {
        let members: Vec<String> = (0..n)
            .map(|i| {
                let addr = Address::from_public_key(&[i as u8; 32]);
                format!("\"{}\"", addr)
            })
            .collect();
        format!("[{}]", members.join(", "))
    }

    #[test]
    fn consensus_size_for_canonical_dynasty() {
        assert_eq!(consensus_size(DYNASTY_SIZE), 15);
        assert_eq!(consensus_size(3), 3);
        assert_eq!(consensus_size(1), 1);
    }

    #[test]
    fn magic_spells_neb1() {
        assert_eq!(&MESSAGE_MAGIC.to_be_bytes(), b"NEB1");
    }

    #[test]
    fn timing_constants_sanity() {
        assert!(MIN_MINT_DURATION_MS < MAX_MINT_DURATION_MS);
        assert!(MAX_MINT_DURATION_MS < BLOCK_INTERVAL_MS);
        assert_eq!(BLOCK_INTERVAL_MS % 1000, 0);
        assert!(ROUTE_TABLE_SYNC_INTERVAL < ROUTE_TABLE_SAVE_INTERVAL);
    }

    #[test]
    fn parses_a_minimal_file() {
        let raw = format!(
            r#"
[chain]
chain_id = 7
enable_mint = true

[network]
listen = ["/ip4/127.0.0.1/tcp/9000"]

[consensus]
dynasty_size = 3

[genesis]
chain_id = 7
timestamp = 1500
dynasty = {}

[[genesis.distribution]]
address = "{}"
value = "1000000000000000000000"

[log]
format = "json"
"#,
            dynasty_toml(3),
            Address::from_public_key(&[9u8; 32])
        );
        let config = NodeConfig::from_toml(&raw).unwrap();
        assert_eq!(config.chain.chain_id, 7);
        assert!(config.chain.enable_mint);
        assert_eq!(config.consensus.dynasty_size, 3);
        assert_eq!(config.consensus.block_interval_ms, BLOCK_INTERVAL_MS);
        assert_eq!(config.genesis.dynasty.len(), 3);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.network.bucket_size, DEFAULT_BUCKET_SIZE);
    }

    #[test]
    fn rejects_mismatched_chain_id() {
        let raw = format!(
            "[chain]\nchain_id = 1\n[consensus]\ndynasty_size = 1\n[genesis]\nchain_id = 2\ndynasty = {}\n",
            dynasty_toml(1)
        );
        assert!(matches!(
            NodeConfig::from_toml(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_empty_or_wrong_size_dynasty() {
        let empty = "[genesis]\nchain_id = 100\n";
        assert!(NodeConfig::from_toml(empty).is_err());

        let short = format!("[genesis]\nchain_id = 100\ndynasty = {}\n", dynasty_toml(4));
        assert!(NodeConfig::from_toml(&short).is_err());
    }

    #[test]
    fn rejects_unaligned_genesis_timestamp() {
        let raw = format!(
            "[consensus]\ndynasty_size = 1\n[genesis]\nchain_id = 100\ntimestamp = 7\ndynasty = {}\n",
            dynasty_toml(1)
        );
        assert!(NodeConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = NodeConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
