use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::context::Endpoints;
use crate::error::ConfigError;
use crate::ramp::RampPlanner;
use crate::rpc::RpcSettings;
use crate::scenario::ScenarioKind;
use crate::signer::normalize_address;
use crate::wallet::PrivateKey;
use crate::ws::WsSettings;

/// Environment variable that overrides `funder.private_key`.
pub const FUNDER_KEY_ENV: &str = "ETHLOAD_FUNDER_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    pub target: TargetConfig,
    pub load: LoadProfile,
    #[serde(default)]
    pub wallets: WalletConfig,
    #[serde(default)]
    pub funder: FunderConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub contracts: ContractConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies overrides from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(FUNDER_KEY_ENV) {
            if !key.trim().is_empty() {
                self.funder.private_key = Some(key.trim().to_string());
            }
        }
    }

    pub fn scenario(&self) -> Result<ScenarioKind, ConfigError> {
        self.run
            .scenario
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                field: "run.scenario",
                reason,
            })
    }

    /// Every check that must pass before a worker starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scenario = self.scenario()?;

        if self.target.http_urls.is_empty() {
            return Err(ConfigError::Invalid {
                field: "target.http_urls",
                reason: "at least one endpoint is required".into(),
            });
        }
        for url in &self.target.http_urls {
            check_url(url, &["http", "https"])?;
        }
        for url in &self.target.ws_urls {
            check_url(url, &["ws", "wss"])?;
        }
        if scenario.uses_websocket() && self.target.ws_urls.is_empty() {
            return Err(ConfigError::MissingField {
                scenario: scenario.id(),
                field: "target.ws_urls",
            });
        }
        if self.target.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "target.timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.target.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "target.connect_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }

        self.load.validate()?;
        self.validate_wallets(scenario)?;
        self.validate_contracts(scenario)?;
        Ok(())
    }

    fn validate_wallets(&self, scenario: ScenarioKind) -> Result<(), ConfigError> {
        let wallets = &self.wallets;
        self.funding_amount()?;
        if wallets.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "wallets.batch_size",
                reason: "must be greater than zero".into(),
            });
        }

        if scenario.sends_transactions() {
            if wallets.count == 0 {
                return Err(ConfigError::MissingField {
                    scenario: scenario.id(),
                    field: "wallets.count",
                });
            }
            // Generated wallets start empty; only the funding pass gives them gas.
            if !wallets.fund {
                return Err(ConfigError::Invalid {
                    field: "wallets.fund",
                    reason: format!("scenario {} sends transactions from generated wallets", scenario.id()),
                });
            }
        }
        if (wallets.fund || wallets.drain) && self.funder.private_key.is_none() {
            return Err(ConfigError::MissingField {
                scenario: scenario.id(),
                field: "funder.private_key",
            });
        }
        if let Some(key) = &self.funder.private_key {
            PrivateKey::from_hex(key).map_err(|e| ConfigError::Invalid {
                field: "funder.private_key",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn validate_contracts(&self, scenario: ScenarioKind) -> Result<(), ConfigError> {
        let contracts = &self.contracts;
        for (field, address) in [
            ("contracts.token_address", &contracts.token_address),
            ("contracts.contract_address", &contracts.contract_address),
            ("contracts.log_address", &contracts.log_address),
        ] {
            if let Some(address) = address {
                normalize_address(address)
                    .map_err(|reason| ConfigError::Invalid { field, reason })?;
            }
        }

        let required = match scenario {
            ScenarioKind::Erc20Transfer => {
                self.token_amount()?;
                self.token_funding()?;
                Some(("contracts.token_address", contracts.token_address.is_some()))
            }
            ScenarioKind::Call | ScenarioKind::EstimateGas => Some((
                "contracts.contract_address",
                contracts.contract_address.is_some(),
            )),
            ScenarioKind::TransactionReceipt => Some((
                "contracts.receipt_tx_hash",
                contracts.receipt_tx_hash.is_some() || self.wallets.fund,
            )),
            _ => None,
        };
        match required {
            Some((field, false)) => Err(ConfigError::MissingField {
                scenario: scenario.id(),
                field,
            }),
            _ => Ok(()),
        }
    }

    pub fn funding_amount(&self) -> Result<u128, ConfigError> {
        parse_amount("wallets.funding_amount_wei", &self.wallets.funding_amount_wei)
    }

    pub fn token_amount(&self) -> Result<u128, ConfigError> {
        parse_amount("contracts.token_amount", &self.contracts.token_amount)
    }

    pub fn token_funding(&self) -> Result<u128, ConfigError> {
        parse_amount("contracts.token_funding", &self.contracts.token_funding)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            http: self.target.http_urls.clone(),
            ws: self.target.ws_urls.clone(),
        }
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            timeout: Duration::from_millis(self.target.timeout_ms),
            max_retries: self.target.max_retries,
            retry_delay: Duration::from_millis(self.target.retry_delay_ms),
        }
    }

    pub fn ws_settings(&self) -> WsSettings {
        WsSettings {
            idle_timeout: Duration::from_millis(self.target.timeout_ms),
            connect_timeout: Duration::from_millis(self.target.connect_timeout_ms),
            max_retries: self.target.max_retries,
            retry_delay: Duration::from_millis(self.target.retry_delay_ms),
        }
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Endpoint {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Endpoint {
            url: raw.to_string(),
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(())
}

fn parse_amount(field: &'static str, raw: &str) -> Result<u128, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{raw:?} is not an integer amount: {e}"),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Scenario identifier, e.g. `eth_blockNumber` or `erc20_transfer`.
    pub scenario: String,
    /// Run identifier; generated from the start time when absent.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// HTTP JSON-RPC endpoints (workers are assigned round-robin).
    pub http_urls: Vec<String>,
    #[serde(default)]
    pub ws_urls: Vec<String>,
    /// Per-attempt timeout in milliseconds; also the subscription idle timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// One step of a load profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// VUs for VU executors, iterations per second for arrival-rate ones.
    pub target: u64,
    pub hold_ms: u64,
}

/// Scheduling shape of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum LoadProfile {
    ConstantVus {
        vus: u64,
        duration_ms: u64,
    },
    RampingVus {
        stages: Vec<Stage>,
    },
    ConstantArrivalRate {
        rate: u64,
        duration_ms: u64,
        max_vus: u64,
    },
    RampingArrivalRate {
        stages: Vec<Stage>,
        max_vus: u64,
    },
}

impl LoadProfile {
    pub fn planner(&self) -> RampPlanner {
        match self {
            LoadProfile::ConstantVus { vus, duration_ms } => RampPlanner::constant(*vus, *duration_ms),
            LoadProfile::ConstantArrivalRate {
                rate, duration_ms, ..
            } => RampPlanner::constant(*rate, *duration_ms),
            LoadProfile::RampingVus { stages } | LoadProfile::RampingArrivalRate { stages, .. } => {
                RampPlanner::new(stages.clone())
            }
        }
    }

    pub fn is_arrival_rate(&self) -> bool {
        matches!(
            self,
            LoadProfile::ConstantArrivalRate { .. } | LoadProfile::RampingArrivalRate { .. }
        )
    }

    /// Upper bound on concurrently running iterations.
    pub fn max_vus(&self) -> u64 {
        match self {
            LoadProfile::ConstantArrivalRate { max_vus, .. }
            | LoadProfile::RampingArrivalRate { max_vus, .. } => *max_vus,
            LoadProfile::ConstantVus { .. } | LoadProfile::RampingVus { .. } => {
                self.planner().peak()
            }
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.planner().total_duration_ms())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let planner = self.planner();
        if planner.stages().is_empty() {
            return Err(ConfigError::Invalid {
                field: "load.stages",
                reason: "at least one stage is required".into(),
            });
        }
        if planner.total_duration_ms() == 0 {
            return Err(ConfigError::Invalid {
                field: "load",
                reason: "duration must be greater than zero".into(),
            });
        }
        if self.max_vus() == 0 {
            return Err(ConfigError::Invalid {
                field: "load",
                reason: "profile never runs a virtual user".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Ephemeral wallets to generate; one per worker, round-robin.
    #[serde(default)]
    pub count: usize,
    /// Seed for deterministic key generation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub fund: bool,
    /// Return leftover balances to the funder at teardown.
    #[serde(default)]
    pub drain: bool,
    /// Native amount per wallet (u128 as string to preserve precision).
    #[serde(default = "default_funding_amount")]
    pub funding_amount_wei: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between funding batches.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            count: 0,
            seed: default_seed(),
            fund: false,
            drain: false,
            funding_amount_wei: default_funding_amount(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_funding_amount() -> String {
    "1000000000000000000".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunderConfig {
    /// Hex private key of the funding account (test keys only).
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Queried with `eth_chainId` when absent.
    #[serde(default)]
    pub id: Option<u64>,
    /// Queried with `eth_gasPrice` when absent.
    #[serde(default)]
    pub gas_price_wei: Option<u64>,
    /// Gas for native transfers.
    #[serde(default = "default_transfer_gas")]
    pub transfer_gas: u64,
    /// Gas for contract calls such as token transfers.
    #[serde(default = "default_contract_gas")]
    pub contract_gas: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            id: None,
            gas_price_wei: None,
            transfer_gas: default_transfer_gas(),
            contract_gas: default_contract_gas(),
        }
    }
}

fn default_transfer_gas() -> u64 {
    21_000
}

fn default_contract_gas() -> u64 {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    /// ERC-20 token used by `erc20_transfer`.
    #[serde(default)]
    pub token_address: Option<String>,
    /// Target of `eth_call` and `eth_estimateGas`.
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub call_data: String,
    /// Emitter filtered by `eth_getLogs` and `ws_logs`.
    #[serde(default)]
    pub log_address: Option<String>,
    #[serde(default)]
    pub receipt_tx_hash: Option<String>,
    /// Token units moved by each `erc20_transfer` iteration.
    #[serde(default = "default_token_amount")]
    pub token_amount: String,
    /// Token units the funder sends each wallet at setup.
    #[serde(default = "default_token_funding")]
    pub token_funding: String,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            token_address: None,
            contract_address: None,
            call_data: String::new(),
            log_address: None,
            receipt_tx_hash: None,
            token_amount: default_token_amount(),
            token_funding: default_token_funding(),
        }
    }
}

fn default_token_amount() -> String {
    "1".to_string()
}

fn default_token_funding() -> String {
    "1000000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier for results files.
    #[serde(default = "default_worker_id")]
    pub id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    "worker-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[run]
scenario = "eth_blockNumber"

[target]
http_urls = ["http://localhost:8545", "http://localhost:8546"]
ws_urls = ["ws://localhost:8546"]
timeout_ms = 5000

[load]
executor = "ramping-vus"

[[load.stages]]
target = 10
hold_ms = 5000

[[load.stages]]
target = 20
hold_ms = 10000
"#;

    fn with(extra: &str) -> Config {
        Config::from_toml(&format!("{BASE}\n{extra}")).unwrap()
    }

    #[test]
    fn test_config_serde() {
        let config = Config::from_toml(BASE).unwrap();
        assert_eq!(config.run.scenario, "eth_blockNumber");
        assert_eq!(config.target.http_urls.len(), 2);
        assert_eq!(config.target.max_retries, 3);
        assert_eq!(config.target.retry_delay_ms, 500);
        assert_eq!(config.load.planner().total_duration_ms(), 15000);
        assert_eq!(config.load.max_vus(), 20);
        assert!(!config.load.is_arrival_rate());
        assert_eq!(config.wallets.batch_size, 50);
        assert_eq!(config.chain.transfer_gas, 21_000);
        assert_eq!(config.worker.id, "worker-1");
        config.validate().unwrap();
    }

    #[test]
    fn test_arrival_rate_profile() {
        let config = Config::from_toml(
            r#"
[run]
scenario = "eth_gasPrice"

[target]
http_urls = ["https://rpc.example.org"]

[load]
executor = "constant-arrival-rate"
rate = 200
duration_ms = 60000
max_vus = 50
"#,
        )
        .unwrap();

        assert!(config.load.is_arrival_rate());
        assert_eq!(config.load.max_vus(), 50);
        assert_eq!(config.load.planner().current_target(0), Some(200));
        assert_eq!(config.load.duration(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_scenario_is_rejected() {
        let mut config = Config::from_toml(BASE).unwrap();
        config.run.scenario = "eth_mine".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "run.scenario",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_endpoint_scheme() {
        let mut config = Config::from_toml(BASE).unwrap();
        config.target.http_urls = vec!["ws://localhost:8546".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Endpoint { .. })));

        config.target.http_urls = vec!["not a url".into()];
        assert!(matches!(config.validate(), Err(ConfigError::Endpoint { .. })));
    }

    #[test]
    fn test_token_transfer_requires_token_and_funder() {
        let mut config = with("[wallets]\ncount = 4\nfund = true\n");
        config.run.scenario = "erc20_transfer".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                field: "funder.private_key",
                ..
            })
        ));

        config.funder.private_key = Some("0x1234".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "funder.private_key",
                ..
            })
        ));

        config.funder.private_key = Some("01".repeat(32));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                field: "contracts.token_address",
                ..
            })
        ));

        config.contracts.token_address = Some("0x5FbDB2315678afecb367f032d93F642f64180aa3".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_transaction_scenario_requires_funding() {
        let mut config = with("[wallets]\ncount = 4\n");
        config.run.scenario = "eth_sendRawTransaction".into();
        config.funder.private_key = Some("01".repeat(32));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "wallets.fund",
                ..
            })
        ));

        config.wallets.fund = true;
        config.validate().unwrap();

        // Read-only scenarios never touch wallet balances.
        config.run.scenario = "eth_getBalance".into();
        config.wallets.fund = false;
        config.funder.private_key = None;
        config.validate().unwrap();
    }

    #[test]
    fn test_ws_scenario_requires_ws_endpoint() {
        let mut config = Config::from_toml(BASE).unwrap();
        config.run.scenario = "ws_newHeads".into();
        config.validate().unwrap();

        config.target.ws_urls.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                field: "target.ws_urls",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_amount_and_zero_timeout() {
        let mut config = with("[wallets]\nfunding_amount_wei = \"ten\"\n");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "wallets.funding_amount_wei",
                ..
            })
        ));

        config.wallets.funding_amount_wei = "10".into();
        config.target.timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "target.timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_empty_profile_is_rejected() {
        let mut config = Config::from_toml(BASE).unwrap();
        config.load = LoadProfile::ConstantVus {
            vus: 0,
            duration_ms: 1000,
        };
        assert!(config.validate().is_err());

        config.load = LoadProfile::RampingArrivalRate {
            stages: vec![],
            max_vus: 10,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let config = Config::from_toml(BASE).unwrap();
        let rpc = config.rpc_settings();
        assert_eq!(rpc.timeout, Duration::from_millis(5000));
        assert_eq!(rpc.max_retries, 3);
        assert_eq!(config.ws_settings().idle_timeout, Duration::from_millis(5000));
        assert_eq!(config.endpoints().http_for(1), Some("http://localhost:8546"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_toml(include_str!("../../../config/example.local.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.scenario().unwrap(), ScenarioKind::BlockNumber);
        assert_eq!(config.load.planner().peak(), 20);
        assert_eq!(config.load.duration(), Duration::from_secs(50));
        assert_eq!(config.chain.id, None);
    }
}
