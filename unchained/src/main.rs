use alloy_primitives::Address;
use eyre::{Result, WrapErr};
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use unchained_index::chain::RpcChainClient;
use unchained_index::chunk::{BloomSummary, CacheLayout, CacheType, ChunkStats};
use unchained_index::cli::{Command, IndexConfig, SyncScope};
use unchained_index::logging::init_tracing;
use unchained_index::manifest::Manifest;
use unchained_index::sync::{GatewayClient, ProgressAggregator, SyncOutcome, SyncPipeline};
use unchained_index::timestamps::TimestampTable;
use unchained_index::walker::{
    AddressScan, AppearanceScan, BloomSummaryScan, IndexWalker, WalkTarget,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = IndexConfig::from_args();
    init_tracing(config.verbosity);
    let layout = config.layout();
    info!(cache = %layout.root().display(), chain = %config.chain, "unchained index cache");

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match &config.command {
        Command::Init { scope } => run_init(&config, *scope, cancel).await,
        Command::Blooms { blocks } => run_blooms(&layout, blocks),
        Command::Addresses { addresses } => run_addresses(&layout, addresses),
        Command::Appearances { blocks } => run_appearances(&layout, blocks, config.test_cap()),
        Command::List => run_list(&layout),
        Command::RepairTimestamps { rpc_url, blocks } => {
            run_repair_timestamps(&config, &layout, rpc_url, blocks).await
        }
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, finishing in-flight commits");
            cancel.cancel();
        }
    });
}

async fn run_init(
    config: &IndexConfig,
    scope: SyncScope,
    cancel: CancellationToken,
) -> Result<()> {
    let remote =
        GatewayClient::new(&config.gateway_url, &config.manifest_url, config.fetch_timeout())
            .wrap_err("failed to build gateway client")?;
    let aggregator = if !config.no_progress && std::io::stderr().is_terminal() {
        ProgressAggregator::with_bar()
    } else {
        ProgressAggregator::new()
    };
    let aggregator = Arc::new(aggregator);
    let pipeline = SyncPipeline::new(config.layout(), Arc::new(remote), config.sync_config())
        .with_aggregator(Arc::clone(&aggregator));

    let kinds: &[CacheType] = match scope {
        SyncScope::Blooms => &[CacheType::Bloom],
        SyncScope::All => &[CacheType::Bloom, CacheType::Index],
    };
    let report = pipeline.init(kinds, cancel).await;
    aggregator.finish();
    let report = report.wrap_err("sync failed")?;

    match report.outcome() {
        SyncOutcome::FullySynced => {
            info!(
                committed = report.committed(),
                corrections = report.corrections(),
                "cache fully synced"
            );
            Ok(())
        }
        SyncOutcome::PartiallySynced { failed } => {
            for chunk in report.pipelines.iter().flat_map(|pipeline| &pipeline.failed) {
                warn!(range = %chunk.range, "chunk still missing");
            }
            eyre::bail!("partially synced: {failed} chunks failed after retries")
        }
        SyncOutcome::Cancelled => {
            warn!(committed = report.committed(), "sync cancelled");
            Ok(())
        }
    }
}

/// Walks the saved manifest when there is one, the committed blooms otherwise.
fn open_walker(layout: &CacheLayout) -> Result<IndexWalker> {
    let manifest_path = layout.manifest_path();
    if manifest_path.exists() {
        let manifest = Manifest::load(&manifest_path).wrap_err("failed to load saved manifest")?;
        return Ok(IndexWalker::from_manifest(layout.clone(), &manifest));
    }
    IndexWalker::from_cache(layout.clone()).wrap_err("failed to list cached blooms")
}

fn block_target(blocks: &[u64]) -> WalkTarget {
    if blocks.is_empty() {
        WalkTarget::All
    } else {
        WalkTarget::blocks(blocks.iter().copied())
    }
}

fn run_blooms(layout: &CacheLayout, blocks: &[u64]) -> Result<()> {
    let walker = open_walker(layout)?;
    let mut summaries = Vec::new();
    let mut scan = BloomSummaryScan::new(|summary: &BloomSummary| summaries.push(*summary));
    let walked = walker.walk(&block_target(blocks), &mut scan)?;
    let decode_errors = scan.errors().len();
    drop(scan);

    for summary in &summaries {
        println!("{}", serde_json::to_string(summary)?);
    }
    info!(
        visited = walked.visited,
        missing_blooms = walked.missing_blooms,
        decode_errors,
        "bloom summary finished"
    );
    Ok(())
}

fn run_addresses(layout: &CacheLayout, addresses: &[String]) -> Result<()> {
    let addresses = addresses
        .iter()
        .map(|text| Address::from_str(text).wrap_err_with(|| format!("invalid address {text}")))
        .collect::<Result<Vec<_>>>()?;
    let walker = open_walker(layout)?;

    let mut scan = AddressScan::new(addresses, |address, range, record| {
        println!(
            "{address}\t{}\t{}\t{range}",
            record.block_number, record.transaction_index
        );
    });
    let summary = walker.walk(&WalkTarget::All, &mut scan)?;
    let stats = scan.stats();
    info!(
        visited = summary.visited,
        bloom_hits = stats.bloom_hits,
        false_positives = stats.false_positives,
        decode_errors = scan.errors().len(),
        "address scan finished"
    );
    Ok(())
}

fn run_appearances(layout: &CacheLayout, blocks: &[u64], test_cap: Option<usize>) -> Result<()> {
    let walker = open_walker(layout)?;
    let target = block_target(blocks);

    let mut scan = AppearanceScan::new(|range, record| {
        println!("{}\t{}\t{range}", record.block_number, record.transaction_index);
    });
    if let Some(cap) = test_cap {
        scan = scan.with_test_cap(cap);
    }
    let summary = walker.walk(&target, &mut scan)?;
    info!(
        visited = summary.visited,
        missing_blooms = summary.missing_blooms,
        decode_errors = scan.errors().len(),
        "appearance scan finished"
    );
    Ok(())
}

fn run_list(layout: &CacheLayout) -> Result<()> {
    for range in layout.list_bloom_ranges()? {
        let stats = ChunkStats::from_bloom_path(&layout.bloom_path(&range))?;
        println!("{}", serde_json::to_string(&stats)?);
    }
    Ok(())
}

async fn run_repair_timestamps(
    config: &IndexConfig,
    layout: &CacheLayout,
    rpc_url: &str,
    blocks: &[u64],
) -> Result<()> {
    let client = RpcChainClient::new(rpc_url, config.fetch_timeout())
        .wrap_err("failed to build rpc client")?;
    let table = TimestampTable::new(layout.timestamps_path());
    let count = table.count().wrap_err("timestamp table unreadable")?;
    for block in blocks {
        if !table.repair(*block, &client).await? {
            warn!(block, count, "block is past the end of the timestamp table");
        }
    }
    Ok(())
}
