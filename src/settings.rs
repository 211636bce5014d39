//! INI-style configuration: a `[Main]` section naming the exchange wallets
//! and one section per currency ticker carrying the chain parameters. Also
//! hosts the locktime compatibility rules a chain must pass before its
//! wallet is connected.

use log::warn;
use thiserror::Error;

use std::collections::HashMap;
use std::str::FromStr;

use crate::connector::{CreateTxMethod, WalletParam};

/// Minimum locktime distance expressed in blocks.
pub const MIN_LOCKTIME_BLOCKS: u32 = 10;
/// Upper bound on the maker-side locktime window, in seconds.
pub const MAKER_LOCKTIME_TARGET_SECONDS: u32 = 7200;
/// Upper bound on the taker-side locktime window of fast chains, in
/// seconds.
pub const TAKER_LOCKTIME_TARGET_SECONDS: u32 = 3600;
/// Chains at or above this block time are treated as slow.
pub const SLOW_BLOCKTIME_SECONDS: u32 = 600;
/// Taker locktime bound applied to slow chains, in seconds.
pub const SLOW_TAKER_LOCKTIME_TARGET_SECONDS: u32 = 7200;
/// Allowed locktime drift, in seconds.
pub const LOCKTIME_DRIFT_SECONDS: u32 = 1800;
/// Allowed locktime drift, in blocks.
pub const MAX_LOCKTIME_DRIFT_BLOCKS: u32 = 6;

/// Configuration errors, reported per wallet so one broken section does not
/// take the rest of the configuration down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing configuration section [{0}]")]
    MissingSection(String),
    #[error("{0}: invalid value for {1}")]
    InvalidValue(String, &'static str),
    #[error("{0}: incomplete connection settings")]
    ConnectionInfo(String),
    #[error("{0}: failed maker locktime requirements")]
    MakerLocktime(String),
    #[error("{0}: failed taker locktime requirements")]
    TakerLocktime(String),
    #[error("{0}: confirmations exceed the allowed maximum of {1}")]
    Confirmations(String, u32),
}

/// Startup flags consumed from the host environment.
#[derive(Debug, Clone)]
pub struct StartupOptions {
    /// Show orders for wallets that are not installed locally.
    pub dx_no_wallets: bool,
    /// Bound on concurrent wallet reachability probes.
    pub rpc_threads: u32,
    /// Cap of the processed-message set, in megabytes.
    pub max_mempool_mb: u32,
}

impl Default for StartupOptions {
    fn default() -> Self {
        StartupOptions {
            dx_no_wallets: false,
            rpc_threads: 4,
            max_mempool_mb: 128,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Settings {
    /// Parse `key=value` sections. Unknown keys are kept verbatim; lines
    /// starting with `#` or `;` are comments.
    pub fn parse(content: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_owned();
                sections.entry(current.clone()).or_default();
                continue;
            }
            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim().to_owned();
                let value = line[eq + 1..].trim().to_owned();
                sections.entry(current.clone()).or_default().insert(key, value);
            }
        }

        Settings { sections }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|s| s.as_str())
    }

    fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    fn get_parsed<T: FromStr>(&self, section: &str, key: &str, default: T) -> T {
        match self.get(section, key) {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(v, "true" | "1" | "yes"),
            None => default,
        }
    }

    /// Tickers listed under `[Main] ExchangeWallets=`.
    pub fn exchange_wallets(&self) -> Vec<String> {
        self.get_or("Main", "ExchangeWallets", "")
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn full_log(&self) -> bool {
        self.get_bool("Main", "FullLog", false)
    }

    pub fn show_all_orders(&self) -> bool {
        self.get_bool("Main", "ShowAllOrders", false)
    }

    /// Assemble the chain parameters for `ticker` from its section.
    pub fn wallet_param(&self, ticker: &str) -> Result<WalletParam, SettingsError> {
        if !self.sections.contains_key(ticker) {
            return Err(SettingsError::MissingSection(ticker.to_owned()));
        }

        let method = self
            .get_or(ticker, "CreateTxMethod", "")
            .parse::<CreateTxMethod>()
            .map_err(|_| SettingsError::InvalidValue(ticker.to_owned(), "CreateTxMethod"))?;

        let wp = WalletParam {
            currency: ticker.to_owned(),
            title: self.get_or(ticker, "Title", "").to_owned(),
            address: self.get_or(ticker, "Address", "").to_owned(),
            ip: self.get_or(ticker, "Ip", "").to_owned(),
            port: self.get_or(ticker, "Port", "").to_owned(),
            username: self.get_or(ticker, "Username", "").to_owned(),
            password: self.get_or(ticker, "Password", "").to_owned(),
            addr_prefix: self.get_parsed(ticker, "AddressPrefix", 0u8),
            script_prefix: self.get_parsed(ticker, "ScriptPrefix", 0u8),
            secret_prefix: self.get_parsed(ticker, "SecretPrefix", 0u8),
            coin: self.get_parsed(ticker, "COIN", 0u64),
            minimum_amount: self.get_parsed(ticker, "MinimumAmount", 0u64),
            tx_version: self.get_parsed(ticker, "TxVersion", 1u32),
            dust_amount: self.get_parsed(ticker, "DustAmount", 0u64),
            method,
            get_new_key_supported: self.get_bool(ticker, "GetNewKeySupported", false),
            import_with_no_scan_supported: self.get_bool(ticker, "ImportWithNoScanSupported", false),
            min_tx_fee: self.get_parsed(ticker, "MinTxFee", 0u64),
            block_time: self.get_parsed(ticker, "BlockTime", 0u32),
            fee_per_byte: self.get_parsed(ticker, "FeePerByte", 0u64),
            required_confirmations: self.get_parsed(ticker, "Confirmations", 0u32),
            tx_with_time_field: self.get_bool(ticker, "TxWithTimeField", false),
            lock_coins_supported: self.get_bool(ticker, "LockCoinsSupported", false),
            json_version: self.get_or(ticker, "JSONVersion", "").to_owned(),
            content_type: self.get_or(ticker, "ContentType", "").to_owned(),
        };

        if wp.username.is_empty() || wp.password.is_empty() {
            warn!("{} \"{}\" has empty credentials", wp.currency, wp.title);
        }

        validate_wallet_param(&wp)?;
        Ok(wp)
    }
}

/// Reject chain parameters a swap cannot be safely scheduled on.
pub fn validate_wallet_param(wp: &WalletParam) -> Result<(), SettingsError> {
    if wp.ip.is_empty() || wp.port.is_empty() || wp.coin == 0 || wp.block_time == 0 {
        return Err(SettingsError::ConnectionInfo(wp.currency.clone()));
    }

    if wp.block_time * MIN_LOCKTIME_BLOCKS > MAKER_LOCKTIME_TARGET_SECONDS {
        return Err(SettingsError::MakerLocktime(wp.currency.clone()));
    }
    if wp.block_time < SLOW_BLOCKTIME_SECONDS
        && wp.block_time * MIN_LOCKTIME_BLOCKS > TAKER_LOCKTIME_TARGET_SECONDS
    {
        return Err(SettingsError::TakerLocktime(wp.currency.clone()));
    }
    // Slow chains get a wider taker target; reject only when even that is
    // unreachable.
    if wp.block_time >= SLOW_BLOCKTIME_SECONDS
        && wp.block_time * MIN_LOCKTIME_BLOCKS > SLOW_TAKER_LOCKTIME_TARGET_SECONDS
    {
        return Err(SettingsError::TakerLocktime(wp.currency.clone()));
    }

    let max_confirmations =
        std::cmp::max(LOCKTIME_DRIFT_SECONDS / wp.block_time, MAX_LOCKTIME_DRIFT_BLOCKS);
    if wp.required_confirmations > max_confirmations {
        return Err(SettingsError::Confirmations(
            wp.currency.clone(),
            max_confirmations,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# sample configuration
[Main]
ExchangeWallets=BTC,LTC
FullLog=true
ShowAllOrders=false

[BTC]
Title=Bitcoin
Address=
Ip=127.0.0.1
Port=8332
Username=user
Password=pass
AddressPrefix=0
ScriptPrefix=5
SecretPrefix=128
COIN=100000000
TxVersion=1
DustAmount=0
CreateTxMethod=BTC
MinTxFee=10000
BlockTime=60
FeePerByte=20
Confirmations=2
TxWithTimeField=false

[LTC]
Ip=127.0.0.1
Port=9332
Username=user
Password=pass
COIN=100000000
CreateTxMethod=BTC
BlockTime=90
"#;

    #[test]
    fn parses_main_section() {
        let s = Settings::parse(SAMPLE);
        assert_eq!(s.exchange_wallets(), vec!["BTC", "LTC"]);
        assert!(s.full_log());
        assert!(!s.show_all_orders());
    }

    #[test]
    fn wallet_param_from_section() {
        let s = Settings::parse(SAMPLE);
        let wp = s.wallet_param("BTC").unwrap();
        assert_eq!(wp.coin, 100_000_000);
        assert_eq!(wp.block_time, 60);
        assert_eq!(wp.fee_per_byte, 20);
        assert_eq!(wp.script_prefix, 5);
        assert_eq!(wp.method, CreateTxMethod::Btc);
    }

    #[test]
    fn missing_section_is_an_error() {
        let s = Settings::parse(SAMPLE);
        assert_eq!(
            s.wallet_param("DOGE"),
            Err(SettingsError::MissingSection("DOGE".into()))
        );
    }

    #[test]
    fn incomplete_connection_rejected() {
        let s = Settings::parse("[XX]\nCreateTxMethod=BTC\nCOIN=100000000\n");
        assert!(matches!(
            s.wallet_param("XX"),
            Err(SettingsError::ConnectionInfo(_))
        ));
    }

    #[test]
    fn maker_locktime_rule() {
        let s = Settings::parse(SAMPLE);
        let mut wp = s.wallet_param("BTC").unwrap();
        // Ten blocks must fit inside the maker window.
        wp.block_time = 721;
        assert!(matches!(
            validate_wallet_param(&wp),
            Err(SettingsError::MakerLocktime(_))
        ));
    }

    #[test]
    fn taker_locktime_rule_fast_chain() {
        let s = Settings::parse(SAMPLE);
        let mut wp = s.wallet_param("BTC").unwrap();
        wp.block_time = 400; // fast chain, 10 * 400 > 3600
        assert!(matches!(
            validate_wallet_param(&wp),
            Err(SettingsError::TakerLocktime(_))
        ));
    }

    #[test]
    fn slow_chain_uses_wider_taker_target() {
        let s = Settings::parse(SAMPLE);
        let mut wp = s.wallet_param("BTC").unwrap();
        // A 600s chain fails the fast-chain taker bound but is accepted
        // under the slow-chain target.
        wp.block_time = 600;
        assert!(validate_wallet_param(&wp).is_ok());
    }

    #[test]
    fn confirmations_cap() {
        let s = Settings::parse(SAMPLE);
        let mut wp = s.wallet_param("BTC").unwrap();
        // 1800 / 60 = 30 allowed confirmations.
        wp.required_confirmations = 31;
        assert!(matches!(
            validate_wallet_param(&wp),
            Err(SettingsError::Confirmations(_, 30))
        ));
        wp.required_confirmations = 30;
        assert!(validate_wallet_param(&wp).is_ok());
    }
}
