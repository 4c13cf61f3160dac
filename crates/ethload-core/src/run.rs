//! Test run controller: setup, execution window, teardown and the run summary.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RunContext;
use crate::executor::{ExecutionReport, Executor};
use crate::metrics::{names, tags, MetricsAggregator, MetricsSnapshot, SeriesValue};
use crate::nonce::{NonceCoordinator, RpcNonceSource};
use crate::rpc::RpcClient;
use crate::scenario::{erc20_transfer_data, ChainParams, Dispatcher, Scenario, ScenarioKind};
use crate::signer::{TxFields, TxSigner};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::wallet::{PrivateKey, Wallet, WalletPool};
use crate::ws::SubscriptionManager;

const SETUP_LABEL: &str = "setup";
const TEARDOWN_LABEL: &str = "teardown";

/// State produced by `setup` and consumed by the later phases.
struct Prepared {
    chain: ChainParams,
    funder: Option<Wallet>,
    wallets: Arc<WalletPool>,
    funding_hashes: Vec<String>,
}

pub struct TestRun {
    config: Config,
    kind: ScenarioKind,
    ctx: RunContext,
    setup_url: String,
    rpc: Arc<RpcClient>,
    ws: Arc<SubscriptionManager>,
    nonces: Arc<NonceCoordinator>,
    signer: Arc<dyn TxSigner>,
    http_client: &'static str,
    prepared: Option<Prepared>,
}

impl TestRun {
    pub fn new(config: Config, signer: Arc<dyn TxSigner>) -> Result<Self> {
        let transport = ReqwestTransport::new().context("failed to build HTTP client")?;
        Self::with_transport(config, signer, Arc::new(transport))
    }

    pub fn with_transport(
        config: Config,
        signer: Arc<dyn TxSigner>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let kind = config.scenario()?;

        let run_id = config
            .run
            .id
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y%m%d_%H%M%S").to_string());
        let ctx = RunContext::new(
            run_id,
            kind.id(),
            config.endpoints(),
            Arc::new(MetricsAggregator::new()),
        );
        let setup_url = ctx
            .endpoints()
            .http_for(0)
            .context("no HTTP endpoint configured")?
            .to_string();

        let http_client = transport.name();
        info!(
            run_id = ctx.run_id(),
            scenario = kind.id(),
            http_client,
            signer = signer.name(),
            "test run created"
        );

        let rpc = Arc::new(RpcClient::new(transport, config.rpc_settings(), ctx.clone()));
        let ws = Arc::new(SubscriptionManager::new(config.ws_settings(), ctx.clone()));
        let nonces = Arc::new(NonceCoordinator::new(Arc::new(RpcNonceSource::new(
            rpc.clone(),
            setup_url.clone(),
        ))));

        Ok(Self {
            config,
            kind,
            ctx,
            setup_url,
            rpc,
            ws,
            nonces,
            signer,
            http_client,
            prepared: None,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn nonces(&self) -> &Arc<NonceCoordinator> {
        &self.nonces
    }

    /// Wallets generated by `setup`, if it has run.
    pub fn wallets(&self) -> Option<&WalletPool> {
        self.prepared.as_ref().map(|p| p.wallets.as_ref())
    }

    pub fn funding_hashes(&self) -> &[String] {
        self.prepared
            .as_ref()
            .map(|p| p.funding_hashes.as_slice())
            .unwrap_or_default()
    }

    /// Resolves chain parameters, generates and funds the wallet pool.
    /// Every failure here is fatal.
    pub async fn setup(&mut self) -> Result<()> {
        let wallet_cfg = self.config.wallets.clone();
        let chain = self.resolve_chain().await?;

        let funder = match &self.config.funder.private_key {
            Some(key) => {
                let key = PrivateKey::from_hex(key).context("invalid funder key")?;
                let funder = Wallet::from_key(key, self.signer.as_ref())?;
                self.nonces.register(&funder.address, None).await;
                Some(funder)
            }
            None => None,
        };

        let pool = WalletPool::generate(wallet_cfg.count, wallet_cfg.seed, self.signer.as_ref())
            .context("failed to generate wallets")?;
        // Seeds repeat across runs, so a wallet may already have history on
        // this chain. Its baseline is fetched on first use.
        for wallet in pool.wallets() {
            self.nonces.register(&wallet.address, None).await;
        }
        info!(
            run_id = self.ctx.run_id(),
            scenario = self.kind.id(),
            wallets = pool.len(),
            chain_id = chain.chain_id,
            gas_price = %chain.gas_price,
            "setup: wallet pool ready"
        );

        let mut funding_hashes = Vec::new();
        let funding = funder
            .as_ref()
            .filter(|_| wallet_cfg.fund && !pool.is_empty());
        if let Some(funder) = funding {
            let amount = self.config.funding_amount()?;
            let txs = pool
                .wallets()
                .iter()
                .map(|w| TxFields {
                    nonce: 0,
                    gas_price: chain.gas_price,
                    gas: chain.transfer_gas,
                    to: Some(w.address.clone()),
                    value: amount,
                    data: String::new(),
                    chain_id: chain.chain_id,
                })
                .collect();
            funding_hashes = self.send_from_funder(funder, txs, "fund").await?;

            if self.kind == ScenarioKind::Erc20Transfer {
                let token = self
                    .config
                    .contracts
                    .token_address
                    .clone()
                    .context("erc20_transfer requires contracts.token_address")?;
                let units = self.config.token_funding()?;
                let mut txs = Vec::with_capacity(pool.len());
                for wallet in pool.wallets() {
                    let data = erc20_transfer_data(&wallet.address, units)
                        .map_err(anyhow::Error::msg)?;
                    txs.push(TxFields {
                        nonce: 0,
                        gas_price: chain.gas_price,
                        gas: chain.contract_gas,
                        to: Some(token.clone()),
                        value: 0,
                        data,
                        chain_id: chain.chain_id,
                    });
                }
                let hashes = self.send_from_funder(funder, txs, "distribute").await?;
                funding_hashes.extend(hashes);
            }
        }

        self.prepared = Some(Prepared {
            chain,
            funder,
            wallets: Arc::new(pool),
            funding_hashes,
        });
        Ok(())
    }

    async fn resolve_chain(&self) -> Result<ChainParams> {
        let cfg = &self.config.chain;
        let needs_network = self.kind.sends_transactions()
            || self.config.wallets.fund
            || self.config.wallets.drain;

        let chain_id = match cfg.id {
            Some(id) => id,
            None if needs_network => self
                .rpc
                .chain_id(&self.setup_url, SETUP_LABEL)
                .await
                .context("failed to resolve chain id")?,
            None => 0,
        };
        let gas_price = match cfg.gas_price_wei {
            Some(price) => u128::from(price),
            None if needs_network => self
                .rpc
                .gas_price(&self.setup_url, SETUP_LABEL)
                .await
                .context("failed to resolve gas price")?,
            None => 0,
        };

        Ok(ChainParams {
            chain_id,
            gas_price,
            transfer_gas: cfg.transfer_gas,
            contract_gas: cfg.contract_gas,
        })
    }

    /// Sends funder transactions in batches, each batch on a contiguous
    /// nonce range. Returns the accepted transaction hashes.
    async fn send_from_funder(
        &self,
        funder: &Wallet,
        txs: Vec<TxFields>,
        phase: &str,
    ) -> Result<Vec<String>> {
        let batch_size = self.config.wallets.batch_size.max(1);
        let batch_delay = Duration::from_millis(self.config.wallets.batch_delay_ms);
        let total = txs.len();
        let mut hashes = Vec::with_capacity(total);

        for (index, chunk) in txs.chunks(batch_size).enumerate() {
            if index > 0 && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }

            let range = self
                .nonces
                .allocate_range(&funder.address, chunk.len() as u64)
                .await
                .with_context(|| format!("{phase}: failed to reserve funder nonces"))?;

            let mut raws = Vec::with_capacity(chunk.len());
            for (tx, nonce) in chunk.iter().zip(range.range.clone()) {
                let tx = TxFields {
                    nonce,
                    ..tx.clone()
                };
                raws.push(
                    self.signer
                        .sign(&tx, &funder.key)
                        .with_context(|| format!("{phase}: failed to sign nonce {nonce}"))?,
                );
            }

            let results = join_all(
                raws.iter()
                    .map(|raw| self.rpc.send_raw_transaction(&self.setup_url, raw, SETUP_LABEL)),
            )
            .await;

            let mut accepted = 0;
            for result in results {
                let ok = result.is_ok();
                self.record_setup_tx(phase, ok);
                match result {
                    Ok(hash) => {
                        accepted += 1;
                        hashes.push(hash);
                    }
                    Err(e) => warn!(phase, error = %e, "setup transaction rejected"),
                }
            }
            info!(
                phase,
                batch = index + 1,
                nonces = ?range.range,
                accepted,
                sent = chunk.len(),
                "setup batch sent"
            );
        }

        if hashes.is_empty() && total > 0 {
            bail!("{phase}: no setup transaction was accepted");
        }
        Ok(hashes)
    }

    fn record_setup_tx(&self, phase: &str, ok: bool) {
        let tags = self
            .ctx
            .base_tags()
            .with(tags::PHASE, phase)
            .with(tags::OUTCOME, if ok { "success" } else { "failure" });
        self.ctx
            .metrics()
            .add(&names::SETUP_TRANSACTIONS, 1.0, &tags);
    }

    /// Drives the scenario under the configured load profile.
    pub async fn execute(&self) -> Result<ExecutionReport> {
        let prepared = self
            .prepared
            .as_ref()
            .context("setup must complete before execute")?;
        let scenario = Scenario::from_config(&self.config, &prepared.funding_hashes)?;
        let dispatcher = Arc::new(Dispatcher::new(
            scenario,
            self.rpc.clone(),
            self.ws.clone(),
            self.nonces.clone(),
            self.signer.clone(),
            prepared.wallets.clone(),
            prepared.chain,
        ));
        Ok(Executor::new(self.config.load.clone(), dispatcher).run().await)
    }

    /// Returns each wallet's balance, minus the transfer fee, to the funder.
    /// Failures are logged and skipped. Returns the number of drained wallets.
    pub async fn teardown(&self) -> u64 {
        let Some(prepared) = &self.prepared else {
            return 0;
        };
        let Some(funder) = prepared.funder.as_ref().filter(|_| self.config.wallets.drain) else {
            return 0;
        };

        let chain = prepared.chain;
        let fee = chain.gas_price.saturating_mul(u128::from(chain.transfer_gas));
        let batch_delay = Duration::from_millis(self.config.wallets.batch_delay_ms);
        let mut drained = 0u64;

        let batches = prepared.wallets.wallets().chunks(self.config.wallets.batch_size.max(1));
        for (index, batch) in batches.enumerate() {
            if index > 0 && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|wallet| self.drain_wallet(wallet, &funder.address, chain, fee)),
            )
            .await;
            drained += results.into_iter().filter(|ok| *ok).count() as u64;
        }

        info!(
            drained,
            wallets = prepared.wallets.len(),
            "teardown: wallets drained"
        );
        drained
    }

    async fn drain_wallet(&self, wallet: &Wallet, to: &str, chain: ChainParams, fee: u128) -> bool {
        let balance = match self
            .rpc
            .balance(&self.setup_url, &wallet.address, TEARDOWN_LABEL)
            .await
        {
            Ok(balance) => balance,
            Err(_) => return false,
        };
        if balance <= fee {
            debug!(address = %wallet.address, %balance, "balance does not cover fee, skipping");
            return false;
        }

        let lease = match self.nonces.allocate(&wallet.address).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(address = %wallet.address, error = %e, "drain: no nonce");
                return false;
            }
        };
        let tx = TxFields {
            nonce: lease.value(),
            gas_price: chain.gas_price,
            gas: chain.transfer_gas,
            to: Some(to.to_string()),
            value: balance - fee,
            data: String::new(),
            chain_id: chain.chain_id,
        };
        let raw = match self.signer.sign(&tx, &wallet.key) {
            Ok(raw) => raw,
            Err(e) => {
                self.nonces.release_unused(lease).await;
                warn!(address = %wallet.address, error = %e, "drain: signing failed");
                return false;
            }
        };

        let ok = self
            .rpc
            .send_raw_transaction(&self.setup_url, &raw, TEARDOWN_LABEL)
            .await
            .is_ok();
        self.record_setup_tx("drain", ok);
        ok
    }

    /// Setup, execution and teardown. Teardown runs even when execution
    /// fails.
    pub async fn run(mut self) -> Result<RunSummary> {
        let started_at = Utc::now();
        self.setup().await?;
        let report = self.execute().await;
        let drained = self.teardown().await;
        let report = report?;

        let mut summary = RunSummary::from_snapshot(
            self.ctx.run_id(),
            self.kind.id(),
            started_at,
            Utc::now(),
            &report,
            self.ctx.metrics().snapshot(),
        );
        summary.drained_wallets = drained;
        summary.signer = self.signer.name().to_string();
        summary.http_client = self.http_client.to_string();
        Ok(summary)
    }
}

/// Per `(method, transport)` call statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallSummary {
    pub method: String,
    pub transport: String,
    pub requests: u64,
    pub success: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub latency_count: u64,
    pub latency_min_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
}

impl CallSummary {
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 / self.requests as f64
    }

    fn merge_latency(&mut self, count: u64, min: f64, avg: f64, max: f64) {
        if count == 0 {
            return;
        }
        let total = self.latency_count + count;
        if self.latency_count == 0 {
            self.latency_min_ms = min;
            self.latency_max_ms = max;
        } else {
            self.latency_min_ms = self.latency_min_ms.min(min);
            self.latency_max_ms = self.latency_max_ms.max(max);
        }
        self.latency_avg_ms = (self.latency_avg_ms * self.latency_count as f64
            + avg * count as f64)
            / total as f64;
        self.latency_count = total;
    }
}

/// What a worker writes to its result file.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub iterations: u64,
    pub failed_iterations: u64,
    pub dropped_iterations: u64,
    pub setup_transactions: u64,
    pub drained_wallets: u64,
    pub signer: String,
    pub http_client: String,
    pub block_height: Option<f64>,
    pub gas_price_wei: Option<f64>,
    pub calls: Vec<CallSummary>,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    pub fn from_snapshot(
        run_id: &str,
        scenario: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &ExecutionReport,
        snapshot: MetricsSnapshot,
    ) -> Self {
        let mut calls: BTreeMap<(String, String), CallSummary> = BTreeMap::new();
        let mut setup_transactions = 0u64;
        let mut block_height = None;
        let mut gas_price_wei = None;

        for series in &snapshot.series {
            if series.name == names::SETUP_TRANSACTIONS.name {
                if let SeriesValue::Counter { value } = series.value {
                    if series.tags.get(tags::OUTCOME) == Some("success") {
                        setup_transactions += value as u64;
                    }
                }
                continue;
            }
            if series.name == names::BLOCK_HEIGHT.name || series.name == names::GAS_PRICE_WEI.name {
                if let SeriesValue::Gauge { value } = series.value {
                    let slot = if series.name == names::BLOCK_HEIGHT.name {
                        &mut block_height
                    } else {
                        &mut gas_price_wei
                    };
                    *slot = Some(slot.map_or(value, |v: f64| v.max(value)));
                }
                continue;
            }

            let (Some(method), Some(transport)) =
                (series.tags.get(tags::METHOD), series.tags.get(tags::TRANSPORT))
            else {
                continue;
            };
            let entry = calls
                .entry((method.to_string(), transport.to_string()))
                .or_insert_with(|| CallSummary {
                    method: method.to_string(),
                    transport: transport.to_string(),
                    ..CallSummary::default()
                });

            match &series.value {
                SeriesValue::Counter { value } => {
                    let value = *value as u64;
                    let name = series.name.as_str();
                    if name == names::RPC_REQUESTS.name {
                        entry.requests += value;
                    } else if name == names::RPC_SUCCESS.name {
                        entry.success += value;
                    } else if name == names::RPC_ERRORS.name {
                        entry.errors += value;
                    } else if name == names::RPC_TIMEOUTS.name {
                        entry.timeouts += value;
                    } else if name == names::RPC_RETRIES.name {
                        entry.retries += value;
                    }
                }
                SeriesValue::Trend(trend) if series.name == names::RPC_LATENCY_MS.name => {
                    entry.merge_latency(trend.count, trend.min, trend.avg, trend.max);
                }
                _ => {}
            }
        }

        Self {
            run_id: run_id.to_string(),
            scenario: scenario.to_string(),
            started_at,
            finished_at,
            duration_ms: report.elapsed.as_millis() as u64,
            iterations: report.iterations,
            failed_iterations: report.failed_iterations,
            dropped_iterations: report.dropped_iterations,
            setup_transactions,
            drained_wallets: 0,
            signer: String::new(),
            http_client: String::new(),
            block_height,
            gas_price_wei,
            calls: calls.into_values().collect(),
            metrics: snapshot,
        }
    }

    /// Iterations per second over the execution window.
    pub fn throughput(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.iterations as f64 * 1000.0 / self.duration_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadProfile;
    use crate::metrics::TagSet;
    use crate::signer::LocalSigner;
    use crate::transport::mock::{MockReply, MockTransport};
    use serde_json::json;

    const FUNDER_KEY: &str = "0x0101010101010101010101010101010101010101010101010101010101010101";
    const TX_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn base_config(scenario: &str) -> Config {
        let mut config = Config::from_toml(&format!(
            r#"
[run]
scenario = "{scenario}"
id = "run-1"

[target]
http_urls = ["http://node-1"]
timeout_ms = 1000
max_retries = 0

[load]
executor = "constant-vus"
vus = 2
duration_ms = 500
"#
        ))
        .unwrap();
        config.wallets.count = 3;
        config.wallets.batch_size = 2;
        config.wallets.batch_delay_ms = 10;
        config
    }

    /// A node that answers every method the run needs, 10ms per call.
    fn node() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|req| {
            let result = match req["method"].as_str().unwrap_or_default() {
                "eth_chainId" => json!("0xc488"),
                "eth_gasPrice" => json!("0x3b9aca00"),
                "eth_getTransactionCount" => json!("0x5"),
                "eth_getBalance" => json!("0xde0b6b3a7640000"),
                "eth_sendRawTransaction" => json!(TX_HASH),
                "eth_getTransactionReceipt" => {
                    json!({"transactionHash": req["params"][0], "blockNumber": "0x10"})
                }
                _ => json!("0x10"),
            };
            MockReply::result(req, result).after(Duration::from_millis(10))
        }))
    }

    fn test_run(config: Config, transport: Arc<MockTransport>) -> TestRun {
        TestRun::with_transport(config, Arc::new(LocalSigner), transport).unwrap()
    }

    fn setup_count(run: &TestRun, phase: &str, outcome: &str) -> f64 {
        run.context().metrics().sum_matching(
            &names::SETUP_TRANSACTIONS,
            &[(tags::PHASE, phase), (tags::OUTCOME, outcome)],
        )
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = base_config("eth_blockNumber");
        config.target.http_urls = vec!["ftp://node-1".into()];
        assert!(TestRun::with_transport(config, Arc::new(LocalSigner), node()).is_err());

        let mut config = base_config("eth_sendRawTransaction");
        config.wallets.fund = true;
        config.funder.private_key = None;
        assert!(TestRun::with_transport(config, Arc::new(LocalSigner), node()).is_err());

        let mut config = base_config("eth_sendRawTransaction");
        config.funder.private_key = Some(FUNDER_KEY.into());
        assert!(TestRun::with_transport(config, Arc::new(LocalSigner), node()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_requires_setup() {
        let run = test_run(base_config("eth_blockNumber"), node());
        assert!(run.execute().await.is_err());
        assert_eq!(run.teardown().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_run_skips_chain_resolution() {
        let transport = node();
        let mut run = test_run(base_config("eth_blockNumber"), transport.clone());
        run.setup().await.unwrap();
        assert_eq!(transport.calls(), 0);
        assert_eq!(run.wallets().map(WalletPool::len), Some(3));
        assert!(run.funding_hashes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_funds_wallets_on_contiguous_funder_nonces() {
        let mut config = base_config("eth_sendRawTransaction");
        config.wallets.fund = true;
        config.funder.private_key = Some(FUNDER_KEY.into());
        let mut run = test_run(config, node());

        run.setup().await.unwrap();

        assert_eq!(run.funding_hashes().len(), 3);
        assert_eq!(setup_count(&run, "fund", "success"), 3.0);
        // Pending count 5, then 5..7 and 7..8 for the two batches.
        let funder = Wallet::from_key(PrivateKey::from_hex(FUNDER_KEY).unwrap(), &LocalSigner).unwrap();
        assert_eq!(run.nonces().peek(&funder.address).await, Some(8));
        for wallet in run.wallets().unwrap().wallets() {
            assert_eq!(run.nonces().peek(&wallet.address).await, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_wallets_resume_from_pending_nonce() {
        let mut config = base_config("eth_sendRawTransaction");
        config.wallets.fund = true;
        config.funder.private_key = Some(FUNDER_KEY.into());
        let mut run = test_run(config.clone(), node());
        run.setup().await.unwrap();

        // Same seed, same addresses; the node reports five prior transactions.
        let again = WalletPool::generate(config.wallets.count, config.wallets.seed, &LocalSigner)
            .unwrap();
        let wallet = &run.wallets().unwrap().wallets()[0];
        assert_eq!(wallet.address, again.wallets()[0].address);
        let lease = run.nonces().allocate(&wallet.address).await.unwrap();
        assert_eq!(lease.value(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fails_when_chain_cannot_be_resolved() {
        let transport = Arc::new(MockTransport::new(|_| MockReply::unreachable()));
        let mut config = base_config("eth_sendRawTransaction");
        config.wallets.fund = true;
        config.funder.private_key = Some(FUNDER_KEY.into());
        let mut run = test_run(config, transport);
        assert!(run.setup().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_drains_back_to_funder() {
        let mut config = base_config("eth_sendRawTransaction");
        config.wallets.fund = true;
        config.wallets.drain = true;
        config.funder.private_key = Some(FUNDER_KEY.into());
        let run = test_run(config, node());
        let metrics = run.context().metrics().clone();

        let summary = run.run().await.unwrap();

        assert_eq!(summary.run_id, "run-1");
        assert_eq!(summary.scenario, "eth_sendRawTransaction");
        assert_eq!(summary.signer, "secp256k1");
        assert_eq!(summary.http_client, "mock");
        assert!(summary.iterations > 0);
        assert_eq!(summary.failed_iterations, 0);
        assert_eq!(summary.drained_wallets, 3);
        assert_eq!(summary.setup_transactions, 6);
        assert_eq!(
            metrics.sum_matching(&names::SETUP_TRANSACTIONS, &[(tags::PHASE, "drain")]),
            3.0
        );
        let sends = summary
            .calls
            .iter()
            .find(|c| c.method == "eth_sendRawTransaction")
            .unwrap();
        assert_eq!(sends.errors, 0);
        assert_eq!(sends.requests, sends.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_scenario_uses_funding_hashes() {
        let mut config = base_config("eth_getTransactionReceipt");
        config.wallets.fund = true;
        config.funder.private_key = Some(FUNDER_KEY.into());
        config.load = LoadProfile::ConstantVus {
            vus: 1,
            duration_ms: 100,
        };
        let mut run = test_run(config, node());

        run.setup().await.unwrap();
        let report = run.execute().await.unwrap();

        assert!(report.iterations > 0);
        assert_eq!(report.failed_iterations, 0);
    }

    #[test]
    fn test_summary_groups_by_method_and_transport() {
        let metrics = MetricsAggregator::new();
        let tags_for = |method: &str, transport: &str| {
            TagSet::new()
                .with(tags::METHOD, method)
                .with(tags::TRANSPORT, transport)
        };
        let http_a = tags_for("eth_blockNumber", "http").with(tags::ENDPOINT, "http://a");
        let http_b = tags_for("eth_blockNumber", "http").with(tags::ENDPOINT, "http://b");
        let ws = tags_for("eth_subscribe", "ws");

        metrics.add(&names::RPC_REQUESTS, 3.0, &http_a);
        metrics.add(&names::RPC_REQUESTS, 1.0, &http_b);
        metrics.add(&names::RPC_SUCCESS, 3.0, &http_a);
        metrics.add(&names::RPC_ERRORS, 1.0, &http_b.clone().with(tags::STAGE, "http"));
        metrics.add(&names::RPC_LATENCY_MS, 10.0, &http_a);
        metrics.add(&names::RPC_LATENCY_MS, 30.0, &http_b);
        metrics.add(&names::RPC_REQUESTS, 2.0, &ws);
        metrics.set(&names::BLOCK_HEIGHT, 100.0, &TagSet::new().with(tags::ENDPOINT, "http://a"));
        metrics.set(&names::BLOCK_HEIGHT, 102.0, &TagSet::new().with(tags::ENDPOINT, "http://b"));
        metrics.add(
            &names::SETUP_TRANSACTIONS,
            4.0,
            &TagSet::new().with(tags::OUTCOME, "success"),
        );
        metrics.add(
            &names::SETUP_TRANSACTIONS,
            1.0,
            &TagSet::new().with(tags::OUTCOME, "failure"),
        );

        let report = ExecutionReport {
            iterations: 10,
            failed_iterations: 1,
            dropped_iterations: 0,
            elapsed: Duration::from_secs(2),
        };
        let now = Utc::now();
        let summary =
            RunSummary::from_snapshot("r", "eth_blockNumber", now, now, &report, metrics.snapshot());

        assert_eq!(summary.calls.len(), 2);
        let http = &summary.calls[0];
        assert_eq!((http.method.as_str(), http.transport.as_str()), ("eth_blockNumber", "http"));
        assert_eq!((http.requests, http.success, http.errors), (4, 3, 1));
        assert_eq!(http.latency_count, 2);
        assert_eq!(http.latency_min_ms, 10.0);
        assert_eq!(http.latency_max_ms, 30.0);
        assert_eq!(http.latency_avg_ms, 20.0);
        assert_eq!(http.error_rate(), 0.25);
        assert_eq!(summary.calls[1].requests, 2);

        assert_eq!(summary.setup_transactions, 4);
        assert_eq!(summary.block_height, Some(102.0));
        assert_eq!(summary.gas_price_wei, None);
        assert_eq!(summary.throughput(), 5.0);
        assert!(serde_json::to_string(&summary).unwrap().contains("\"calls\""));
    }
}
