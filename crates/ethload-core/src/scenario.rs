//! Scenario catalog and dispatcher.
//!
//! A scenario is one operation category. The dispatcher turns a scenario and
//! a worker index into exactly one unit of work against the RPC client,
//! subscription manager and nonce coordinator. Endpoint and wallet follow
//! from the worker index alone, so a worker keeps both for the whole run.

use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::context::{round_robin, RunContext};
use crate::error::{CallError, ConfigError, ErrorKind};
use crate::nonce::NonceCoordinator;
use crate::recorder::{CallLabels, CallRecorder, Transport};
use crate::rpc::{
    parse_quantity, BatchCall, CallOptions, Expect, RpcClient, RpcErrorObject, RpcReply,
};
use crate::signer::{normalize_address, TxFields, TxSigner};
use crate::wallet::{Wallet, WalletPool};
use crate::ws::SubscriptionManager;

/// `transfer(address,uint256)`.
pub const ERC20_TRANSFER_SELECTOR: &str = "a9059cbb";

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Read,
    ContractCall,
    LogQuery,
    BlockQuery,
    TransactionSend,
    Subscription,
    GasEstimate,
    ReceiptFetch,
    Batch,
    RawConnectivity,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Read => "read",
            Category::ContractCall => "contract_call",
            Category::LogQuery => "log_query",
            Category::BlockQuery => "block_query",
            Category::TransactionSend => "transaction_send",
            Category::Subscription => "subscription",
            Category::GasEstimate => "gas_estimate",
            Category::ReceiptFetch => "receipt_fetch",
            Category::Batch => "batch",
            Category::RawConnectivity => "raw_connectivity",
        }
    }
}

/// Selectable scenario identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    BlockNumber,
    GasPrice,
    GetBalance,
    Call,
    GetLogs,
    GetBlockByNumber,
    SendRawTransaction,
    Erc20Transfer,
    WsNewHeads,
    WsLogs,
    EstimateGas,
    TransactionReceipt,
    Batch,
    Connectivity,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 14] = [
        ScenarioKind::BlockNumber,
        ScenarioKind::GasPrice,
        ScenarioKind::GetBalance,
        ScenarioKind::Call,
        ScenarioKind::GetLogs,
        ScenarioKind::GetBlockByNumber,
        ScenarioKind::SendRawTransaction,
        ScenarioKind::Erc20Transfer,
        ScenarioKind::WsNewHeads,
        ScenarioKind::WsLogs,
        ScenarioKind::EstimateGas,
        ScenarioKind::TransactionReceipt,
        ScenarioKind::Batch,
        ScenarioKind::Connectivity,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ScenarioKind::BlockNumber => "eth_blockNumber",
            ScenarioKind::GasPrice => "eth_gasPrice",
            ScenarioKind::GetBalance => "eth_getBalance",
            ScenarioKind::Call => "eth_call",
            ScenarioKind::GetLogs => "eth_getLogs",
            ScenarioKind::GetBlockByNumber => "eth_getBlockByNumber",
            ScenarioKind::SendRawTransaction => "eth_sendRawTransaction",
            ScenarioKind::Erc20Transfer => "erc20_transfer",
            ScenarioKind::WsNewHeads => "ws_newHeads",
            ScenarioKind::WsLogs => "ws_logs",
            ScenarioKind::EstimateGas => "eth_estimateGas",
            ScenarioKind::TransactionReceipt => "eth_getTransactionReceipt",
            ScenarioKind::Batch => "batch",
            ScenarioKind::Connectivity => "connectivity",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            ScenarioKind::BlockNumber | ScenarioKind::GasPrice | ScenarioKind::GetBalance => {
                Category::Read
            }
            ScenarioKind::Call => Category::ContractCall,
            ScenarioKind::GetLogs => Category::LogQuery,
            ScenarioKind::GetBlockByNumber => Category::BlockQuery,
            ScenarioKind::SendRawTransaction | ScenarioKind::Erc20Transfer => {
                Category::TransactionSend
            }
            ScenarioKind::WsNewHeads | ScenarioKind::WsLogs => Category::Subscription,
            ScenarioKind::EstimateGas => Category::GasEstimate,
            ScenarioKind::TransactionReceipt => Category::ReceiptFetch,
            ScenarioKind::Batch => Category::Batch,
            ScenarioKind::Connectivity => Category::RawConnectivity,
        }
    }

    pub fn sends_transactions(&self) -> bool {
        self.category() == Category::TransactionSend
    }

    pub fn uses_websocket(&self) -> bool {
        self.category() == Category::Subscription
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScenarioKind::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| format!("unknown scenario {s:?}"))
    }
}

/// A resolved scenario carrying only the fields its operation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    BlockNumber,
    GasPrice,
    /// Balance of the worker's wallet, or of `fallback` when no wallets exist.
    GetBalance { fallback: String },
    Call { to: String, data: String },
    GetLogs { address: Option<String> },
    GetBlockByNumber,
    /// Zero-value self transfer from the worker's wallet.
    SendRawTransaction,
    /// Token transfer from the worker's wallet to the next wallet in the pool.
    Erc20Transfer { token: String, amount: u128 },
    WsNewHeads,
    WsLogs { address: Option<String> },
    EstimateGas { to: String, data: String },
    /// Receipt of `tx_hashes[worker % len]`.
    TransactionReceipt { tx_hashes: Vec<String> },
    /// `eth_blockNumber`, `eth_gasPrice` and `eth_chainId` in one request.
    Batch,
    Connectivity,
}

impl Scenario {
    /// Resolves the configured scenario. `known_tx_hashes` feeds the receipt
    /// scenario when no hash is configured.
    pub fn from_config(config: &Config, known_tx_hashes: &[String]) -> Result<Self, ConfigError> {
        let kind = config.scenario()?;
        let contracts = &config.contracts;
        let missing = |field| ConfigError::MissingField {
            scenario: kind.id(),
            field,
        };
        let normalized = |field: &'static str, address: &str| {
            normalize_address(address).map_err(|reason| ConfigError::Invalid { field, reason })
        };
        let log_address = contracts
            .log_address
            .as_deref()
            .map(|a| normalized("contracts.log_address", a))
            .transpose()?;
        let contract = || -> Result<String, ConfigError> {
            let address = contracts
                .contract_address
                .as_deref()
                .ok_or_else(|| missing("contracts.contract_address"))?;
            normalized("contracts.contract_address", address)
        };

        let scenario = match kind {
            ScenarioKind::BlockNumber => Scenario::BlockNumber,
            ScenarioKind::GasPrice => Scenario::GasPrice,
            ScenarioKind::GetBalance => Scenario::GetBalance {
                fallback: ZERO_ADDRESS.to_string(),
            },
            ScenarioKind::Call => Scenario::Call {
                to: contract()?,
                data: contracts.call_data.clone(),
            },
            ScenarioKind::GetLogs => Scenario::GetLogs {
                address: log_address,
            },
            ScenarioKind::GetBlockByNumber => Scenario::GetBlockByNumber,
            ScenarioKind::SendRawTransaction => Scenario::SendRawTransaction,
            ScenarioKind::Erc20Transfer => {
                let token = contracts
                    .token_address
                    .as_deref()
                    .ok_or_else(|| missing("contracts.token_address"))?;
                Scenario::Erc20Transfer {
                    token: normalized("contracts.token_address", token)?,
                    amount: config.token_amount()?,
                }
            }
            ScenarioKind::WsNewHeads => Scenario::WsNewHeads,
            ScenarioKind::WsLogs => Scenario::WsLogs {
                address: log_address,
            },
            ScenarioKind::EstimateGas => Scenario::EstimateGas {
                to: contract()?,
                data: contracts.call_data.clone(),
            },
            ScenarioKind::TransactionReceipt => {
                let tx_hashes = match &contracts.receipt_tx_hash {
                    Some(hash) => vec![hash.clone()],
                    None => known_tx_hashes.to_vec(),
                };
                if tx_hashes.is_empty() {
                    return Err(missing("contracts.receipt_tx_hash"));
                }
                Scenario::TransactionReceipt { tx_hashes }
            }
            ScenarioKind::Batch => Scenario::Batch,
            ScenarioKind::Connectivity => Scenario::Connectivity,
        };
        Ok(scenario)
    }

    pub fn kind(&self) -> ScenarioKind {
        match self {
            Scenario::BlockNumber => ScenarioKind::BlockNumber,
            Scenario::GasPrice => ScenarioKind::GasPrice,
            Scenario::GetBalance { .. } => ScenarioKind::GetBalance,
            Scenario::Call { .. } => ScenarioKind::Call,
            Scenario::GetLogs { .. } => ScenarioKind::GetLogs,
            Scenario::GetBlockByNumber => ScenarioKind::GetBlockByNumber,
            Scenario::SendRawTransaction => ScenarioKind::SendRawTransaction,
            Scenario::Erc20Transfer { .. } => ScenarioKind::Erc20Transfer,
            Scenario::WsNewHeads => ScenarioKind::WsNewHeads,
            Scenario::WsLogs { .. } => ScenarioKind::WsLogs,
            Scenario::EstimateGas { .. } => ScenarioKind::EstimateGas,
            Scenario::TransactionReceipt { .. } => ScenarioKind::TransactionReceipt,
            Scenario::Batch => ScenarioKind::Batch,
            Scenario::Connectivity => ScenarioKind::Connectivity,
        }
    }
}

/// Result of one iteration. Failures are already recorded; the run goes on.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Quantity(u128),
    Json(Value),
    TxHash(String),
    /// Gas estimation answered with a revert.
    Reverted(RpcErrorObject),
    Status(u16),
    Failed(ErrorKind),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }
}

/// Chain parameters resolved at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    pub chain_id: u64,
    pub gas_price: u128,
    pub transfer_gas: u64,
    pub contract_gas: u64,
}

/// ABI-encodes `transfer(to, amount)`.
pub fn erc20_transfer_data(to: &str, amount: u128) -> Result<String, String> {
    let to = normalize_address(to)?;
    Ok(format!(
        "0x{ERC20_TRANSFER_SELECTOR}{:0>64}{amount:064x}",
        &to[2..]
    ))
}

pub struct Dispatcher {
    scenario: Scenario,
    rpc: Arc<RpcClient>,
    ws: Arc<SubscriptionManager>,
    nonces: Arc<NonceCoordinator>,
    signer: Arc<dyn TxSigner>,
    wallets: Arc<WalletPool>,
    chain: ChainParams,
    recorder: CallRecorder,
}

impl Dispatcher {
    pub fn new(
        scenario: Scenario,
        rpc: Arc<RpcClient>,
        ws: Arc<SubscriptionManager>,
        nonces: Arc<NonceCoordinator>,
        signer: Arc<dyn TxSigner>,
        wallets: Arc<WalletPool>,
        chain: ChainParams,
    ) -> Self {
        let recorder = CallRecorder::new(rpc.context().clone());
        Self {
            scenario,
            rpc,
            ws,
            nonces,
            signer,
            wallets,
            chain,
            recorder,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn context(&self) -> &RunContext {
        self.rpc.context()
    }

    fn id(&self) -> &'static str {
        self.scenario.kind().id()
    }

    /// Runs one unit of work for `worker`.
    pub async fn run_once(&self, worker: usize) -> Outcome {
        let result = if self.scenario.kind().uses_websocket() {
            self.run_ws(worker).await
        } else {
            self.run_http(worker).await
        };
        result.unwrap_or_else(|err| Outcome::Failed(err.kind()))
    }

    async fn run_ws(&self, worker: usize) -> Result<Outcome, CallError> {
        let endpoints = self.rpc.context().endpoints();
        let Some(url) = endpoints.ws_for(worker) else {
            return Err(self.local_failure("eth_subscribe", CallError::Network(
                "no websocket endpoint assigned".into(),
            )));
        };
        let params = match &self.scenario {
            Scenario::WsLogs { address: Some(address) } => json!(["logs", {"address": address}]),
            Scenario::WsLogs { address: None } => json!(["logs", {}]),
            _ => json!(["newHeads"]),
        };
        let event = self.ws.subscribe(url, params, self.id()).await?;
        Ok(Outcome::Json(event))
    }

    async fn run_http(&self, worker: usize) -> Result<Outcome, CallError> {
        let endpoints = self.rpc.context().endpoints();
        let Some(url) = endpoints.http_for(worker) else {
            return Err(self.local_failure(self.id(), CallError::Network(
                "no http endpoint assigned".into(),
            )));
        };
        let opts = |expect| CallOptions::new(self.id()).expect(expect);

        match &self.scenario {
            Scenario::BlockNumber => {
                self.quantity(url, "eth_blockNumber", json!([]), opts(Expect::HexQuantity))
                    .await
            }
            Scenario::GasPrice => {
                self.quantity(url, "eth_gasPrice", json!([]), opts(Expect::HexQuantity))
                    .await
            }
            Scenario::GetBalance { fallback } => {
                let address = self
                    .wallets
                    .for_worker(worker)
                    .map_or(fallback.as_str(), |w| w.address.as_str());
                self.quantity(
                    url,
                    "eth_getBalance",
                    json!([address, "latest"]),
                    opts(Expect::HexQuantity),
                )
                .await
            }
            Scenario::Call { to, data } => {
                let value = self
                    .rpc
                    .call(
                        url,
                        "eth_call",
                        json!([{"to": to, "data": data}, "latest"]),
                        &opts(Expect::HexString),
                    )
                    .await?;
                Ok(Outcome::Json(value))
            }
            Scenario::GetLogs { address } => {
                let mut filter = json!({"fromBlock": "latest", "toBlock": "latest"});
                if let Some(address) = address {
                    filter["address"] = json!(address);
                }
                let value = self
                    .rpc
                    .call(url, "eth_getLogs", json!([filter]), &opts(Expect::Array { min_len: 0 }))
                    .await?;
                Ok(Outcome::Json(value))
            }
            Scenario::GetBlockByNumber => {
                let value = self
                    .rpc
                    .call(
                        url,
                        "eth_getBlockByNumber",
                        json!(["latest", false]),
                        &opts(Expect::Object {
                            fields: &["number", "hash"],
                        }),
                    )
                    .await?;
                Ok(Outcome::Json(value))
            }
            Scenario::SendRawTransaction => {
                let wallet = self.sender(worker)?;
                let tx = TxFields {
                    nonce: 0,
                    gas_price: self.chain.gas_price,
                    gas: self.chain.transfer_gas,
                    to: Some(wallet.address.clone()),
                    value: 0,
                    data: String::new(),
                    chain_id: self.chain.chain_id,
                };
                self.send_transaction(url, wallet, tx).await
            }
            Scenario::Erc20Transfer { token, amount } => {
                let wallet = self.sender(worker)?;
                let recipient = self
                    .wallets
                    .for_worker(worker + 1)
                    .map_or(wallet.address.as_str(), |w| w.address.as_str());
                let data = erc20_transfer_data(recipient, *amount)
                    .map_err(|e| self.local_failure("sign", CallError::Signing(e)))?;
                let tx = TxFields {
                    nonce: 0,
                    gas_price: self.chain.gas_price,
                    gas: self.chain.contract_gas,
                    to: Some(token.clone()),
                    value: 0,
                    data,
                    chain_id: self.chain.chain_id,
                };
                self.send_transaction(url, wallet, tx).await
            }
            Scenario::EstimateGas { to, data } => {
                let from = self
                    .wallets
                    .for_worker(worker)
                    .map_or(ZERO_ADDRESS, |w| w.address.as_str());
                let tx = json!({"from": from, "to": to, "data": data});
                match self.rpc.estimate_gas(url, tx, self.id()).await? {
                    RpcReply::Result(value) => parse_quantity(&value)
                        .map(Outcome::Quantity)
                        .map_err(CallError::Validation),
                    RpcReply::Error(error) => Ok(Outcome::Reverted(error)),
                }
            }
            Scenario::TransactionReceipt { tx_hashes } => {
                let hash = round_robin(tx_hashes, worker)
                    .map(String::as_str)
                    .unwrap_or_default();
                let value = self
                    .rpc
                    .call(
                        url,
                        "eth_getTransactionReceipt",
                        json!([hash]),
                        &opts(Expect::OptionalObject {
                            fields: &["transactionHash", "blockNumber"],
                        }),
                    )
                    .await?;
                Ok(Outcome::Json(value))
            }
            Scenario::Batch => {
                let calls = [
                    BatchCall::new("eth_blockNumber", json!([])),
                    BatchCall::new("eth_gasPrice", json!([])),
                    BatchCall::new("eth_chainId", json!([])),
                ];
                let replies = self
                    .rpc
                    .call_batch(url, &calls, &CallOptions::new(self.id()))
                    .await?;
                let values = replies
                    .into_iter()
                    .map(|reply| match reply {
                        RpcReply::Result(value) => value,
                        RpcReply::Error(error) => json!({ "error": error }),
                    })
                    .collect();
                Ok(Outcome::Json(Value::Array(values)))
            }
            Scenario::Connectivity => {
                let status = self.rpc.probe(url, &CallOptions::new(self.id())).await?;
                Ok(Outcome::Status(status))
            }
            Scenario::WsNewHeads | Scenario::WsLogs { .. } => self.run_ws(worker).await,
        }
    }

    async fn quantity(
        &self,
        url: &str,
        method: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Outcome, CallError> {
        let value = self.rpc.call(url, method, params, &opts).await?;
        parse_quantity(&value)
            .map(Outcome::Quantity)
            .map_err(CallError::Validation)
    }

    fn sender(&self, worker: usize) -> Result<&Wallet, CallError> {
        self.wallets.for_worker(worker).ok_or_else(|| {
            self.local_failure("sign", CallError::Signing("no wallet assigned".into()))
        })
    }

    /// Lease a nonce, sign, submit. Strictly sequential within one iteration.
    async fn send_transaction(
        &self,
        url: &str,
        wallet: &Wallet,
        mut tx: TxFields,
    ) -> Result<Outcome, CallError> {
        let lease = self
            .nonces
            .allocate(&wallet.address)
            .await
            .map_err(|e| self.local_failure("nonce", e))?;
        tx.nonce = lease.value();

        let raw = match self.signer.sign(&tx, &wallet.key) {
            Ok(raw) => raw,
            Err(err) => {
                self.nonces.release_unused(lease).await;
                return Err(self.local_failure("sign", err));
            }
        };

        // Once submitted, the nonce counts as consumed unless the node refused
        // the single attempt outright.
        let submission = self.rpc.submit_raw_transaction(url, &raw, self.id()).await;
        if submission.refused_outright() {
            self.nonces.release_unused(lease).await;
        }
        submission.result.map(Outcome::TxHash)
    }

    /// Records a failure that happened before any network call.
    fn local_failure(&self, method: &str, err: CallError) -> CallError {
        let labels = CallLabels::new(self.id(), method, "local", Transport::Local);
        self.recorder.failure(&labels, &err, Duration::ZERO);
        err
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::{names, tags};
    use crate::nonce::{NonceFuture, NonceSource};
    use crate::rpc::tests::client_with;
    use crate::rpc::RpcSettings;
    use crate::signer::LocalSigner;
    use crate::transport::mock::{MockReply, MockTransport};
    use crate::ws::WsSettings;
    use std::sync::Mutex;

    struct NoNetwork;

    impl NonceSource for NoNetwork {
        fn pending_nonce<'a>(&'a self, _address: &'a str) -> NonceFuture<'a> {
            Box::pin(async { Err(CallError::Network("offline".into())) })
        }
    }

    const TX_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn chain() -> ChainParams {
        ChainParams {
            chain_id: 50312,
            gas_price: 1_000_000_000,
            transfer_gas: 21_000,
            contract_gas: 100_000,
        }
    }

    pub(crate) async fn dispatcher(
        scenario: Scenario,
        transport: Arc<MockTransport>,
        wallets: usize,
    ) -> Dispatcher {
        dispatcher_retrying(scenario, transport, wallets, 0).await
    }

    async fn dispatcher_retrying(
        scenario: Scenario,
        transport: Arc<MockTransport>,
        wallets: usize,
        max_retries: u32,
    ) -> Dispatcher {
        let rpc = Arc::new(client_with(
            RpcSettings {
                timeout: Duration::from_secs(1),
                max_retries,
                retry_delay: Duration::from_millis(1),
            },
            transport,
        ));
        let ws = Arc::new(SubscriptionManager::new(
            WsSettings::default(),
            rpc.context().clone(),
        ));
        let nonces = Arc::new(NonceCoordinator::new(Arc::new(NoNetwork)));
        let pool = WalletPool::generate(wallets, 7, &LocalSigner).unwrap();
        for wallet in pool.wallets() {
            nonces.register(&wallet.address, Some(0)).await;
        }
        Dispatcher::new(
            scenario,
            rpc,
            ws,
            nonces,
            Arc::new(LocalSigner),
            Arc::new(pool),
            chain(),
        )
    }

    fn metric(d: &Dispatcher, m: &crate::metrics::Metric, filter: &[(&str, &str)]) -> f64 {
        d.rpc.context().metrics().sum_matching(m, filter)
    }

    #[tokio::test]
    async fn test_block_number_scenario() {
        let transport = Arc::new(MockTransport::new(|req| MockReply::result(req, json!("0x10"))));
        let d = dispatcher(Scenario::BlockNumber, transport, 0).await;

        assert_eq!(d.run_once(0).await, Outcome::Quantity(16));

        let method = [(tags::METHOD, "eth_blockNumber")];
        assert_eq!(metric(&d, &names::RPC_SUCCESS, &method), 1.0);
        let ctx = d.rpc.context();
        assert_eq!(
            ctx.metrics().gauge(&names::BLOCK_HEIGHT, &ctx.base_tags()),
            Some(16.0)
        );
    }

    #[tokio::test]
    async fn test_gas_estimation_revert_is_reported() {
        let transport = Arc::new(MockTransport::new(|req| {
            MockReply::rpc_error(req, -32000, "execution reverted")
        }));
        let scenario = Scenario::EstimateGas {
            to: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
            data: "0x".into(),
        };
        let d = dispatcher(scenario, transport, 1).await;

        match d.run_once(0).await {
            Outcome::Reverted(e) => assert_eq!(e.message, "execution reverted"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(metric(&d, &names::RPC_ERRORS, &[]), 0.0);
    }

    #[tokio::test]
    async fn test_transaction_send_uses_consecutive_nonces() {
        let transport = Arc::new(MockTransport::new(|req| MockReply::result(req, json!(TX_HASH))));
        let d = dispatcher(Scenario::SendRawTransaction, transport.clone(), 2).await;

        assert_eq!(d.run_once(0).await, Outcome::TxHash(TX_HASH.into()));
        assert_eq!(d.run_once(0).await, Outcome::TxHash(TX_HASH.into()));
        assert_eq!(d.run_once(1).await, Outcome::TxHash(TX_HASH.into()));

        let first = &d.wallets.wallets()[0].address;
        let second = &d.wallets.wallets()[1].address;
        assert_eq!(d.nonces.peek(first).await, Some(2));
        assert_eq!(d.nonces.peek(second).await, Some(1));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_outright_refusal_returns_its_nonce() {
        let transport = Arc::new(MockTransport::new(|req| {
            MockReply::rpc_error(req, -32000, "insufficient funds for gas * price + value")
        }));
        let d = dispatcher(Scenario::SendRawTransaction, transport, 1).await;

        assert_eq!(d.run_once(0).await, Outcome::Failed(ErrorKind::Protocol));
        let address = &d.wallets.wallets()[0].address;
        assert_eq!(d.nonces.peek(address).await, Some(0));
    }

    #[tokio::test]
    async fn test_nonce_too_low_keeps_the_nonce_consumed() {
        let transport = Arc::new(MockTransport::new(|req| {
            MockReply::rpc_error(req, -32000, "nonce too low: next nonce 4, tx nonce 0")
        }));
        let d = dispatcher(Scenario::SendRawTransaction, transport, 1).await;

        assert_eq!(d.run_once(0).await, Outcome::Failed(ErrorKind::Protocol));
        let address = &d.wallets.wallets()[0].address;
        assert_eq!(d.nonces.peek(address).await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_submission_never_reissues_its_nonce() {
        let raws = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = raws.clone();
        let transport = Arc::new(MockTransport::new(move |req| {
            let mut raws = seen.lock().unwrap();
            raws.push(req["params"][0].as_str().unwrap_or_default().to_string());
            match raws.len() {
                // Accepted by the node, but the reply lands at the deadline.
                1 => MockReply::result(req, json!(TX_HASH)).after(Duration::from_millis(990)),
                2 => MockReply::rpc_error(req, -32000, "already known"),
                _ => MockReply::result(req, json!(TX_HASH)),
            }
        }));
        let d = dispatcher_retrying(Scenario::SendRawTransaction, transport.clone(), 1, 1).await;
        let address = d.wallets.wallets()[0].address.clone();

        assert_eq!(d.run_once(0).await, Outcome::Failed(ErrorKind::Protocol));
        assert_eq!(d.nonces.peek(&address).await, Some(1));
        assert_eq!(d.run_once(0).await, Outcome::TxHash(TX_HASH.into()));
        assert_eq!(d.nonces.peek(&address).await, Some(2));

        let raws = raws.lock().unwrap();
        assert_eq!(raws.len(), 3);
        // The retry resends the same signed bytes; the next iteration signs
        // a different nonce.
        assert_eq!(raws[0], raws[1]);
        assert_ne!(raws[2], raws[0]);
        assert_eq!(
            metric(&d, &names::RPC_RETRIES, &[(tags::METHOD, "eth_sendRawTransaction")]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_missing_wallet_is_a_recorded_failure() {
        let transport = Arc::new(MockTransport::new(|req| MockReply::result(req, json!(TX_HASH))));
        let d = dispatcher(Scenario::SendRawTransaction, transport.clone(), 0).await;

        assert_eq!(d.run_once(0).await, Outcome::Failed(ErrorKind::Signing));
        assert_eq!(transport.calls(), 0);
        assert_eq!(
            metric(&d, &names::RPC_ERRORS, &[(tags::STAGE, "sign"), (tags::TRANSPORT, "local")]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_batch_scenario_keeps_element_errors() {
        let transport = Arc::new(MockTransport::new(|req| {
            let replies: Vec<Value> = req
                .as_array()
                .unwrap()
                .iter()
                .map(|item| match item["method"].as_str() {
                    Some("eth_chainId") => json!({"jsonrpc": "2.0", "id": item["id"],
                        "error": {"code": -32601, "message": "disabled"}}),
                    _ => json!({"jsonrpc": "2.0", "id": item["id"], "result": "0x5"}),
                })
                .collect();
            MockReply::json(Value::Array(replies))
        }));
        let d = dispatcher(Scenario::Batch, transport, 0).await;

        let Outcome::Json(Value::Array(values)) = d.run_once(0).await else {
            panic!("expected array");
        };
        assert_eq!(values[0], json!("0x5"));
        assert_eq!(values[2]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_receipt_scenario_accepts_pending() {
        let transport = Arc::new(MockTransport::new(|req| {
            assert_eq!(req["params"][0], json!(TX_HASH));
            MockReply::result(req, Value::Null)
        }));
        let scenario = Scenario::TransactionReceipt {
            tx_hashes: vec![TX_HASH.into()],
        };
        let d = dispatcher(scenario, transport, 0).await;
        assert_eq!(d.run_once(3).await, Outcome::Json(Value::Null));
    }

    #[test]
    fn test_scenario_ids_round_trip() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.id().parse::<ScenarioKind>(), Ok(kind));
        }
        assert!("eth_mine".parse::<ScenarioKind>().is_err());
        assert!(ScenarioKind::Erc20Transfer.sends_transactions());
        assert!(ScenarioKind::WsLogs.uses_websocket());
        assert!(!ScenarioKind::EstimateGas.sends_transactions());
    }

    #[test]
    fn test_erc20_transfer_encoding() {
        let data = erc20_transfer_data("0x5FbDB2315678afecb367f032d93F642f64180aa3", 1000).unwrap();
        assert_eq!(data.len(), 2 + 8 + 64 + 64);
        assert!(data.starts_with("0xa9059cbb0000000000000000000000005fbdb231"));
        assert!(data.ends_with("3e8"));
        assert!(erc20_transfer_data("0x12", 1).is_err());
    }

    #[test]
    fn test_from_config_resolves_fields() {
        let mut config = Config::from_toml(
            r#"
[run]
scenario = "eth_getTransactionReceipt"

[target]
http_urls = ["http://localhost:8545"]

[load]
executor = "constant-vus"
vus = 1
duration_ms = 1000
"#,
        )
        .unwrap();

        assert!(Scenario::from_config(&config, &[]).is_err());
        let scenario = Scenario::from_config(&config, &[TX_HASH.to_string()]).unwrap();
        assert_eq!(scenario.kind(), ScenarioKind::TransactionReceipt);

        config.run.scenario = "eth_call".into();
        config.contracts.contract_address = Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".into());
        config.contracts.call_data = "0x18160ddd".into();
        assert_eq!(
            Scenario::from_config(&config, &[]).unwrap(),
            Scenario::Call {
                to: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
                data: "0x18160ddd".into(),
            }
        );
    }
}
