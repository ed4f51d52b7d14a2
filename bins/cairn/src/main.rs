//! cairn: operator commands over a cairn data directory.
//!
//! Reads the RocksDB chain state and block store under the data directory
//! and prints results as JSON. `import` populates both from a file of blocks.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use cairn_chainstate::{BlockReplayer, ChainStateBuilder};
use cairn_core::traits::BlockTxSource;
use cairn_core::types::{Block, ChainedHeader, Hash256, Transaction};
use cairn_core::validation::StandardRules;
use cairn_core::walker::BlockchainWalker;
use cairn_node::{LogFormat, NodeConfig, RocksBlockStore, RocksChainStateStorage, logging};

/// Cairn chain-state operator CLI.
#[derive(Parser)]
#[command(name = "cairn", version, about = "Inspect and maintain a cairn chain state")]
struct Cli {
    /// Configuration file (TOML). `CAIRN_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding `chainstate/` and `blocks/`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format ("text" or "json").
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store blocks from a JSON-lines file and add those extending the tip.
    Import(ImportArgs),
    /// Show the chain tip and UTXO counts.
    Tip,
    /// Compute the rewind/advance path between two blocks.
    Path(PathArgs),
    /// Replay a block's transactions with the outputs they spent.
    Replay(ReplayArgs),
    /// Roll back blocks from the tip.
    Rollback(RollbackArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// One serialized block (`{"header": ..., "transactions": [...]}`) per
    /// line. `-` reads standard input.
    file: PathBuf,
}

#[derive(Args)]
struct PathArgs {
    /// Target block hash.
    to: Hash256,

    /// Starting block hash (default: current tip).
    #[arg(long)]
    from: Option<Hash256>,
}

#[derive(Args)]
struct ReplayArgs {
    /// Block hash to replay.
    hash: Hash256,
}

#[derive(Args)]
struct RollbackArgs {
    /// Number of blocks to roll back.
    #[arg(short, long, default_value_t = 1)]
    count: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.log_level, config.log_format);

    match cli.command {
        Commands::Import(args) => import(&config, args),
        Commands::Tip => tip(&config),
        Commands::Path(args) => path(&config, args),
        Commands::Replay(args) => replay(&config, args),
        Commands::Rollback(args) => rollback(&config, args),
    }
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config =
        NodeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    match cli.log_format.as_deref() {
        None => {}
        Some("json") => config.log_format = LogFormat::Json,
        Some("text") => config.log_format = LogFormat::Text,
        Some(other) => bail!("unknown log format: {other}"),
    }
    Ok(config)
}

fn open(config: &NodeConfig) -> Result<(ChainStateBuilder, Arc<RocksBlockStore>)> {
    let storage = RocksChainStateStorage::open(config.chainstate_path())
        .with_context(|| format!("failed to open {}", config.chainstate_path().display()))?;
    let blocks = Arc::new(
        RocksBlockStore::open(config.blocks_path())
            .with_context(|| format!("failed to open {}", config.blocks_path().display()))?,
    );
    let builder = ChainStateBuilder::new(
        Box::new(storage),
        blocks.clone(),
        Arc::new(StandardRules),
        config.builder_config(),
    )?;
    Ok((builder, blocks))
}

fn import(config: &NodeConfig, args: ImportArgs) -> Result<()> {
    let (builder, blocks) = open(config)?;
    let reader: Box<dyn BufRead> = if args.file.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(&args.file)
            .with_context(|| format!("failed to open {}", args.file.display()))?;
        Box::new(BufReader::new(file))
    };

    let (mut added, mut stored) = (0u64, 0u64);
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let block: Block = serde_json::from_str(&line)
            .with_context(|| format!("line {}: malformed block", number + 1))?;
        let header = chain_header(&blocks, &block)
            .with_context(|| format!("line {}", number + 1))?;
        if blocks.try_get_block_header(&header.hash)?.is_none() {
            blocks.add_block(&header, &block.transactions)?;
            stored += 1;
        }

        let extends_tip = match builder.chain().tip() {
            Some(tip) => tip.hash == header.header.prev_hash,
            None => header.height == 0,
        };
        if extends_tip {
            builder
                .add_block(&header, &block.transactions)
                .with_context(|| format!("block {} at height {}", header.hash, header.height))?;
            added += 1;
        } else {
            info!(hash = %header.hash, height = header.height, "stored block off the tip");
        }
    }

    let tip = builder.chain().tip().cloned();
    let out = json!({
        "stored": stored,
        "added": added,
        "height": tip.as_ref().map(|t| t.height),
        "hash": tip.map(|t| t.hash.to_string()),
    });
    println!("{out}");
    Ok(())
}

/// Chain position of `block`, from its stored parent or as a genesis block.
fn chain_header(blocks: &RocksBlockStore, block: &Block) -> Result<ChainedHeader> {
    let prev_hash = block.header.prev_hash;
    if prev_hash == Hash256::ZERO {
        return Ok(ChainedHeader::genesis(block.header.clone()));
    }
    let parent = blocks
        .try_get_block_header(&prev_hash)?
        .with_context(|| format!("parent {prev_hash} is not stored"))?;
    Ok(ChainedHeader::from_parent(&parent, block.header.clone()))
}

fn tip(config: &NodeConfig) -> Result<()> {
    let (builder, _) = open(config)?;
    let state = builder.to_chain_state()?;
    let out = json!({
        "height": state.height(),
        "hash": state.tip().map(|t| t.hash.to_string()),
        "total_work": state.tip().map(|t| t.total_work.to_string()),
        "unspent_txs": state.unspent_tx_count(),
        "unspent_outputs": state.utxo().unspent_output_count(),
        "spent_txs": state.utxo().spent.len(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn path(config: &NodeConfig, args: PathArgs) -> Result<()> {
    let (builder, blocks) = open(config)?;
    let chain = builder.chain();
    let from = match args.from {
        Some(hash) => blocks
            .try_get_block_header(&hash)?
            .with_context(|| format!("unknown block {hash}"))?,
        None => chain.tip().cloned().context("chain is empty")?,
    };
    let to = blocks
        .try_get_block_header(&args.to)?
        .with_context(|| format!("unknown block {}", args.to))?;

    let path = BlockchainWalker::get_path(&from, &to, |hash| {
        blocks.try_get_block_header(hash).ok().flatten()
    })?;
    println!("{}", serde_json::to_string_pretty(&path)?);
    Ok(())
}

fn replay(config: &NodeConfig, args: ReplayArgs) -> Result<()> {
    let (builder, blocks) = open(config)?;
    let state = builder.to_chain_state()?;
    let replayer = BlockReplayer::new(blocks, config.replay.clone());
    let mut session = replayer.start_replay(&state, &args.hash)?;
    info!(mode = ?session.mode(), height = session.header().height, "replaying block");

    for result in session.replay_block()? {
        let item = result?;
        let line = json!({
            "tx_index": item.tx_index,
            "txid": item.txid.to_string(),
            "prev_outputs": item.prev_outputs,
        });
        println!("{line}");
    }
    session.end()?;
    Ok(())
}

fn rollback(config: &NodeConfig, args: RollbackArgs) -> Result<()> {
    let (builder, blocks) = open(config)?;
    for _ in 0..args.count {
        let Some(tip) = builder.chain().tip().cloned() else {
            bail!("chain is empty");
        };
        let txs: Vec<Transaction> = blocks
            .read_block(&tip)?
            .into_iter()
            .map(|(_, tx)| Transaction::clone(&tx))
            .collect();
        builder.rollback_block(&tip, &txs)?;
        println!("{}", json!({ "rolled_back": tip.hash.to_string(), "height": tip.height }));
    }
    Ok(())
}
