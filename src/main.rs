use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use blockindexer::api::{build_router, ApiState};
use blockindexer::chain::{ChainTail, TailUpdate};
use blockindexer::checkpoint::Checkpoint;
use blockindexer::config::{self, ChainConfig, Config, Dialect, SourceConfig};
use blockindexer::decode::EventDecoder;
use blockindexer::errors::IndexerError;
use blockindexer::filter::{AddressConstraint, ChildAddressRegistry, Fragment, FragmentKind, FilterEvaluator, MatchSet};
use blockindexer::handler::{Handler, HandlerContext};
use blockindexer::metrics::{self, SAFE_BLOCK_NUMBER, SYNC_LAG_SECONDS};
use blockindexer::reorg::ReorgController;
use blockindexer::rpc::{ReqwestRpcClient, RpcCache};
use blockindexer::status::StatusStore;
use blockindexer::storage::postgres::PostgresStorage;
use blockindexer::storage::sqlite::SqliteStorage;
use blockindexer::storage::AnyStorage;
use blockindexer::sync::SyncCoordinator;
use blockindexer::telemetry::{init_tracing, TelemetryConfig};
use blockindexer::types::{ChainId, Event, LightBlock, RawLog, B256};

const POLL_INTERVAL: Duration = Duration::from_secs(4);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Placeholder handler wired in until a deployment registers its own. Real
/// deployments build a `HashMap<String, Arc<dyn Handler>>` keyed by source
/// name and pass it in here instead.
struct LoggingHandler;

#[async_trait::async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, _ctx: &HandlerContext, event: &Event) -> Result<(), IndexerError> {
        info!(checkpoint = %event.checkpoint, source = %event.source_name, "event");
        Ok(())
    }
}

async fn connect_storage(config: &Config) -> Result<AnyStorage, IndexerError> {
    match config.database.dialect {
        Dialect::Postgres => Ok(AnyStorage::Postgres(PostgresStorage::connect(&config.database.url).await?)),
        Dialect::Sqlite => Ok(AnyStorage::Sqlite(SqliteStorage::connect(&config.database.url).await?)),
    }
}

/// Where a factory-declared source finds a freshly created child address in
/// its parent log, keyed by the parent source's name.
struct FactoryExtraction {
    address_location: String,
}

fn compile_filters(
    chain: &ChainConfig,
    sources: &[SourceConfig],
    decoder: &mut EventDecoder,
) -> (FilterEvaluator, HashMap<String, FactoryExtraction>) {
    let mut evaluator = FilterEvaluator::new();
    let mut factory_extractions: HashMap<String, FactoryExtraction> = HashMap::new();

    for source in sources {
        match source {
            SourceConfig::Log {
                name,
                chain: chain_name,
                address,
                event_signatures,
                start_block,
                end_block,
                factory,
            } if chain_name == &chain.name => {
                let address_constraint = match factory {
                    Some(f) => {
                        factory_extractions.insert(
                            f.parent_source.clone(),
                            FactoryExtraction { address_location: f.address_location.clone() },
                        );
                        AddressConstraint::Factory
                    }
                    None => {
                        let set = match address {
                            Some(addr) => addr.parse::<Address>().map(|a| MatchSet::One(a.0 .0)).unwrap_or(MatchSet::Any),
                            None => MatchSet::Any,
                        };
                        AddressConstraint::Fixed(set)
                    }
                };
                for signature in event_signatures {
                    if let Err(err) = decoder.register(chain.chain_id, signature) {
                        error!(source = name, %err, "failed to register event signature");
                        continue;
                    }
                    let topic0 = signature.parse::<alloy_json_abi::Event>().map(|e| e.selector().0).ok();
                    evaluator.add_fragment(Fragment {
                        source_name: name.clone(),
                        chain_id: Some(chain.chain_id),
                        start_block: *start_block,
                        end_block: *end_block,
                        kind: FragmentKind::Log {
                            topic0: topic0.map(MatchSet::One).unwrap_or(MatchSet::Any),
                            address: address_constraint.clone(),
                        },
                    });
                }
            }
            SourceConfig::Block {
                name,
                chain: chain_name,
                interval,
                offset,
                start_block,
                end_block,
            } if chain_name == &chain.name => {
                evaluator.add_fragment(Fragment {
                    source_name: name.clone(),
                    chain_id: Some(chain.chain_id),
                    start_block: *start_block,
                    end_block: *end_block,
                    kind: FragmentKind::Block { interval: *interval, offset: *offset },
                });
            }
            SourceConfig::Transfer {
                name,
                chain: chain_name,
                from_address,
                to_address,
                start_block,
                end_block,
            } if chain_name == &chain.name => {
                let from = match from_address {
                    Some(addr) => addr.parse::<Address>().map(|a| MatchSet::One(a.0 .0)).unwrap_or(MatchSet::Any),
                    None => MatchSet::Any,
                };
                let to = match to_address {
                    Some(addr) => addr.parse::<Address>().map(|a| MatchSet::One(a.0 .0)).unwrap_or(MatchSet::Any),
                    None => MatchSet::Any,
                };
                evaluator.add_fragment(Fragment {
                    source_name: name.clone(),
                    chain_id: Some(chain.chain_id),
                    start_block: *start_block,
                    end_block: *end_block,
                    kind: FragmentKind::Transfer { from, to },
                });
            }
            _ => {}
        }
    }
    (evaluator, factory_extractions)
}

/// Pull a freshly created child address out of a factory parent's log,
/// following the `topicN` / `offsetN` location syntax from `FactorySource`.
fn extract_factory_child(log: &RawLog, address_location: &str) -> Option<Address> {
    if let Some(n) = address_location.strip_prefix("topic") {
        let idx: usize = n.parse().ok()?;
        let topic = log.topics.get(idx)?;
        Some(Address::from_slice(&topic.0[12..32]))
    } else if let Some(n) = address_location.strip_prefix("offset") {
        let offset: usize = n.parse().ok()?;
        let bytes = log.data.get(offset..offset + 32)?;
        Some(Address::from_slice(&bytes[12..32]))
    } else {
        None
    }
}

async fn fetch_latest_block(rpc: &RpcCache<AnyStorage, ReqwestRpcClient>, chain_id: ChainId) -> Result<LightBlock, IndexerError> {
    let result = rpc
        .call(chain_id, "eth_getBlockByNumber", None, serde_json::json!(["latest", false]))
        .await?;
    Ok(parse_block(&result))
}

/// Resolve a block by hash, used to walk the remote chain back during a
/// reorg deeper than one block. Returns `None` if the node doesn't know the
/// hash (pruned or never canonical).
async fn fetch_block_by_hash(
    rpc: &RpcCache<AnyStorage, ReqwestRpcClient>,
    chain_id: ChainId,
    hash: B256,
) -> Result<Option<LightBlock>, IndexerError> {
    let result = rpc
        .call(chain_id, "eth_getBlockByHash", None, serde_json::json!([hash, false]))
        .await?;
    if result.is_null() {
        return Ok(None);
    }
    Ok(Some(parse_block(&result)))
}

fn parse_hex_u64(s: &str) -> u64 {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or(0)
}

fn parse_block(value: &serde_json::Value) -> LightBlock {
    LightBlock {
        hash: value["hash"].as_str().unwrap_or("0x0").parse().unwrap_or_default(),
        parent_hash: value["parentHash"].as_str().unwrap_or("0x0").parse().unwrap_or_default(),
        number: value["number"].as_str().map(parse_hex_u64).unwrap_or(0),
        timestamp: value["timestamp"].as_str().map(parse_hex_u64).unwrap_or(0),
    }
}

async fn fetch_logs(
    rpc: &RpcCache<AnyStorage, ReqwestRpcClient>,
    chain_id: ChainId,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<RawLog>, IndexerError> {
    let params = serde_json::json!([{
        "fromBlock": format!("0x{from_block:x}"),
        "toBlock": format!("0x{to_block:x}"),
    }]);
    let result = rpc.call(chain_id, "eth_getLogs", Some(from_block), params).await?;
    let entries = result.as_array().cloned().unwrap_or_default();
    Ok(entries.iter().filter_map(|entry| parse_log(chain_id, entry)).collect())
}

fn parse_log(chain_id: ChainId, value: &serde_json::Value) -> Option<RawLog> {
    let parse_hex_u32 = |s: &str| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok();
    Some(RawLog {
        chain_id,
        block_number: value["blockNumber"].as_str().map(parse_hex_u64)?,
        transaction_index: parse_hex_u32(value["transactionIndex"].as_str()?)?,
        log_index: parse_hex_u32(value["logIndex"].as_str()?)?,
        address: value["address"].as_str()?.parse().ok()?,
        topics: value["topics"].as_array()?.iter().filter_map(|t| t.as_str()?.parse().ok()).collect(),
        data: hex::decode(value["data"].as_str()?.trim_start_matches("0x")).ok()?,
    })
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
async fn run_chain(
    chain: ChainConfig,
    sources: Vec<SourceConfig>,
    rpc: Arc<RpcCache<AnyStorage, ReqwestRpcClient>>,
    coordinator: Arc<SyncCoordinator>,
    status_store: Arc<StatusStore<AnyStorage>>,
    handler: Arc<dyn Handler>,
    handler_ctx: Arc<HandlerContext>,
    reorg_controller: Arc<ReorgController<AnyStorage>>,
    reorg_depth: usize,
    shutdown: CancellationToken,
) {
    let chain_id = chain.chain_id;
    let mut decoder = EventDecoder::new();
    let (evaluator, factory_extractions) = compile_filters(&chain, &sources, &mut decoder);
    let mut tail = ChainTail::new(chain_id, reorg_depth);
    let mut registry = ChildAddressRegistry::new();
    let mut last_processed: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(chain_id, "chain poller shutting down");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let head = match fetch_latest_block(&rpc, chain_id).await {
            Ok(head) => head,
            Err(err) => {
                warn!(chain_id, %err, "failed to fetch latest block");
                continue;
            }
        };

        let update = if tail.is_empty() {
            tail.seed(head.clone());
            TailUpdate::Extended
        } else {
            match tail.extend(head.clone(), |hash| fetch_block_by_hash(&rpc, chain_id, hash)).await {
                Ok(update) => update,
                Err(err) if err.is_fatal() => {
                    error!(chain_id, %err, "fatal chain tail error, stopping chain poller");
                    return;
                }
                Err(err) => {
                    warn!(chain_id, %err, "chain tail error");
                    continue;
                }
            }
        };

        if let TailUpdate::Reorged { .. } = &update {
            match reorg_controller.handle(chain_id, &update, &coordinator, &mut registry).await {
                Ok(Some(info)) => warn!(chain_id, ancestor = info.ancestor_block, orphaned = info.orphaned_blocks, "reorg rolled back"),
                Ok(None) => {}
                Err(err) => {
                    error!(chain_id, %err, "reorg rollback failed");
                    continue;
                }
            }
        }

        let safe_block = head.number.saturating_sub(chain.finality_lag);
        if safe_block <= last_processed {
            continue;
        }

        let logs = match fetch_logs(&rpc, chain_id, last_processed + 1, safe_block).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!(chain_id, %err, "failed to fetch logs");
                continue;
            }
        };

        for log in &logs {
            for matched in evaluator.matches_log(log, &registry) {
                let fragment = evaluator.fragment(matched.fragment_id);
                if let Some(extraction) = factory_extractions.get(&fragment.source_name) {
                    if let Some(child) = extract_factory_child(log, &extraction.address_location) {
                        registry.register(chain_id, child, log.block_number);
                    }
                }
                let args = decoder.decode_log(chain_id, log, "log");
                let checkpoint = Checkpoint::new(chain_id, log.block_number, head.timestamp, log.transaction_index, 3, log.log_index);
                let event = Event {
                    checkpoint,
                    filter_id: matched.fragment_id as u64,
                    source_name: fragment.source_name.clone(),
                    args,
                };
                if let Err(err) = handler.handle(&handler_ctx, &event).await {
                    warn!(chain_id, %err, "handler error, skipping event");
                }
            }
        }

        last_processed = safe_block;
        let progress_checkpoint = Checkpoint::new(chain_id, safe_block, head.timestamp, 0, 0, 0);
        coordinator.new_checkpoint(chain_id, progress_checkpoint);

        SAFE_BLOCK_NUMBER.with_label_values(&[&chain.name]).set(safe_block as i64);
        SYNC_LAG_SECONDS.with_label_values(&[&chain.name]).set(now_secs().saturating_sub(head.timestamp) as i64);

        if let Err(err) = status_store.record_progress(chain_id, progress_checkpoint, true).await {
            warn!(chain_id, %err, "failed to persist status");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("BLOCKINDEXER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    config::init_global_config(&config_path)?;
    let config = config::get_global_config();

    init_tracing(TelemetryConfig::from_config(&config.log))?;
    metrics::init_metrics()?;

    let storage = Arc::new(connect_storage(config).await?);

    let endpoints: HashMap<ChainId, String> = config.chains.iter().map(|c| (c.chain_id, c.rpc_url.clone())).collect();
    let transport = Arc::new(ReqwestRpcClient::new(endpoints, config.rpc_max_concurrency));
    let rpc = Arc::new(RpcCache::new(storage.clone(), transport));

    let coordinator = Arc::new(SyncCoordinator::new(config.chains.iter().map(|c| c.chain_id)));
    let status_store = Arc::new(StatusStore::new(storage.clone(), config.chains.iter().map(|c| c.chain_id).collect()));
    let reorg_controller = Arc::new(ReorgController::new(storage.clone()));

    let handler_ctx = Arc::new(HandlerContext {
        rpc: rpc.clone(),
        tables: HashMap::new(),
    });
    let handler: Arc<dyn Handler> = Arc::new(LoggingHandler);

    let shutdown = CancellationToken::new();

    let api_state = ApiState { status: status_store.clone() };
    let router = build_router(api_state);
    let bind_addr = config.http.bind_addr.clone();
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind http listener");
        info!(%bind_addr, "http server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
            .expect("http server failed");
    });

    let mut chain_tasks = Vec::new();
    for chain in config.chains.clone() {
        chain_tasks.push(tokio::spawn(run_chain(
            chain,
            config.sources.clone(),
            rpc.clone(),
            coordinator.clone(),
            status_store.clone(),
            handler.clone(),
            handler_ctx.clone(),
            reorg_controller.clone(),
            config.reorg_depth,
            shutdown.clone(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(chain_tasks)).await.ok();
    http_task.abort();

    Ok(())
}
