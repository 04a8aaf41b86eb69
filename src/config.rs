//! Immutable application configuration.
//!
//! Built once at startup from environment-style key/value pairs and passed to
//! each component explicitly.

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::{is_md5_hash, Credentials, Password};
use crate::error::ConfigError;
use crate::execution::LedgerPolicy;
use crate::gateway::BackoffPolicy;
use crate::models::{Market, TradingEnv};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 11111;
const DEFAULT_QUOTE_INTERVAL_S: u64 = 3;
const DEFAULT_TIMEOUT_S: u64 = 10;
const DEFAULT_HEARTBEAT_S: u64 = 30;
const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_ORDER_RATE_PER_30S: u32 = 15;

/// Raw keys as they appear in the environment (lowercased by `config`)
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    futu_opend_host: Option<String>,
    futu_opend_port: Option<String>,
    use_md5_hash: Option<String>,
    is_password_hashed: Option<String>,
    futu_account_id: Option<String>,
    futu_account_pwd: Option<String>,
    futu_trade_pwd: Option<String>,
    futu_unlock_trade_pwd: Option<String>,
    trading_env: Option<String>,
    default_market: Option<String>,
    quote_push_interval_s: Option<String>,
    gateway_timeout_s: Option<String>,
    heartbeat_interval_s: Option<String>,
    reconnect_max_failures: Option<String>,
    reconnect_base_delay_s: Option<String>,
    reconnect_max_delay_s: Option<String>,
    order_qty: Option<String>,
    max_position_qty: Option<String>,
    allow_short_sell: Option<String>,
    order_rate_per_30s: Option<String>,
}

/// Where and how to reach the gateway process
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    /// Upper bound for any single gateway call
    pub call_timeout: Duration,
    /// Maximum silence before a health check pings the gateway
    pub heartbeat_interval: Duration,
    /// Order placements allowed per 30 second window
    pub order_rate_per_30s: u32,
}

impl GatewaySettings {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            call_timeout: Duration::from_secs(DEFAULT_TIMEOUT_S),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_S),
            order_rate_per_30s: DEFAULT_ORDER_RATE_PER_30S,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway: GatewaySettings,
    pub credentials: Credentials,
    pub trading_env: TradingEnv,
    pub market: Market,
    pub quote_interval: Duration,
    pub backoff: BackoffPolicy,
    pub max_consecutive_failures: u32,
    pub ledger: LedgerPolicy,
}

impl AppConfig {
    /// Load from process environment (call `dotenvy::dotenv()` first)
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Self::from_source(source)
    }

    /// Load from explicit key/value pairs, e.g. `("FUTU_OPEND_PORT", "11111")`
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(key.as_ref().to_lowercase(), value.as_ref())?;
        }
        Self::from_source(builder.build()?)
    }

    fn from_source(source: config::Config) -> Result<Self, ConfigError> {
        let raw: RawSettings = source.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let host = raw
            .futu_opend_host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or("FUTU_OPEND_PORT", raw.futu_opend_port, DEFAULT_PORT)?;

        let use_md5 = raw.use_md5_hash.as_deref().map(parse_bool).unwrap_or(true);
        let hashed = raw
            .is_password_hashed
            .as_deref()
            .map(parse_bool)
            .unwrap_or(false);

        let credentials = Credentials {
            account_id: raw.futu_account_id.unwrap_or_default(),
            account_pwd: Password::new(raw.futu_account_pwd.unwrap_or_default(), hashed),
            trade_pwd: Password::new(raw.futu_trade_pwd.unwrap_or_default(), hashed),
            unlock_trade_pwd: Password::new(raw.futu_unlock_trade_pwd.unwrap_or_default(), hashed),
            use_md5,
        };
        warn_on_credentials(&credentials, hashed);

        let trading_env = match raw.trading_env.as_deref().map(|v| v.trim().to_uppercase()) {
            None => TradingEnv::Simulate,
            Some(v) if v == "REAL" => TradingEnv::Real,
            Some(v) if v == "SIMULATE" => TradingEnv::Simulate,
            Some(other) => {
                tracing::warn!("Invalid TRADING_ENV value: {}. Defaulting to SIMULATE.", other);
                TradingEnv::Simulate
            }
        };

        let market_name = raw.default_market.unwrap_or_else(|| "HK".to_string());
        let market = Market::from_config_name(&market_name).ok_or_else(|| ConfigError::Invalid {
            key: "DEFAULT_MARKET",
            value: market_name.clone(),
            reason: "expected one of HK, US, CN, CN_SZ, SG".to_string(),
        })?;

        let interval_s: u64 = parse_or(
            "QUOTE_PUSH_INTERVAL_S",
            raw.quote_push_interval_s,
            DEFAULT_QUOTE_INTERVAL_S,
        )?;
        require_positive(
            "QUOTE_PUSH_INTERVAL_S",
            interval_s as i64,
            "interval must be at least one second",
        )?;

        let defaults = BackoffPolicy::default();
        let base_delay_s: u64 = parse_or(
            "RECONNECT_BASE_DELAY_S",
            raw.reconnect_base_delay_s,
            defaults.base.as_secs(),
        )?;
        require_positive(
            "RECONNECT_BASE_DELAY_S",
            base_delay_s as i64,
            "base delay must be at least one second",
        )?;
        let backoff = BackoffPolicy::new(
            Duration::from_secs(base_delay_s),
            Duration::from_secs(parse_or(
                "RECONNECT_MAX_DELAY_S",
                raw.reconnect_max_delay_s,
                defaults.max.as_secs(),
            )?),
        );

        let ledger_defaults = LedgerPolicy::default();
        let ledger = LedgerPolicy {
            order_quantity: parse_or("ORDER_QTY", raw.order_qty, ledger_defaults.order_quantity)?,
            max_long: parse_or(
                "MAX_POSITION_QTY",
                raw.max_position_qty,
                ledger_defaults.max_long,
            )?,
            allow_short: raw
                .allow_short_sell
                .as_deref()
                .map(parse_bool)
                .unwrap_or(ledger_defaults.allow_short),
        };
        require_positive("ORDER_QTY", ledger.order_quantity, "order quantity must be positive")?;
        require_positive(
            "MAX_POSITION_QTY",
            ledger.max_long,
            "position cap must be positive",
        )?;

        let gateway = GatewaySettings {
            host,
            port,
            call_timeout: Duration::from_secs(parse_or(
                "GATEWAY_TIMEOUT_S",
                raw.gateway_timeout_s,
                DEFAULT_TIMEOUT_S,
            )?),
            heartbeat_interval: Duration::from_secs(parse_or(
                "HEARTBEAT_INTERVAL_S",
                raw.heartbeat_interval_s,
                DEFAULT_HEARTBEAT_S,
            )?),
            order_rate_per_30s: parse_or(
                "ORDER_RATE_PER_30S",
                raw.order_rate_per_30s,
                DEFAULT_ORDER_RATE_PER_30S,
            )?
            .max(1),
        };

        Ok(Self {
            gateway,
            credentials,
            trading_env,
            market,
            quote_interval: Duration::from_secs(interval_s),
            backoff,
            max_consecutive_failures: parse_or(
                "RECONNECT_MAX_FAILURES",
                raw.reconnect_max_failures,
                DEFAULT_MAX_FAILURES,
            )?
            .max(1),
            ledger,
        })
    }
}

/// `true`, `1`, `t`, `yes` (any case) are true; everything else is false
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "t" | "yes"
    )
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}

fn require_positive(key: &'static str, value: i64, reason: &str) -> Result<(), ConfigError> {
    if value > 0 {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn warn_on_credentials(credentials: &Credentials, hashed: bool) {
    if hashed {
        let passwords = [
            ("FUTU_ACCOUNT_PWD", &credentials.account_pwd),
            ("FUTU_TRADE_PWD", &credentials.trade_pwd),
            ("FUTU_UNLOCK_TRADE_PWD", &credentials.unlock_trade_pwd),
        ];
        for (key, password) in passwords {
            if !password.is_empty() && !is_md5_hash(password.value.expose()) {
                tracing::warn!("{} does not appear to be an MD5 hash", key);
            }
        }
    }

    if credentials.account_id.is_empty() || credentials.account_pwd.is_empty() {
        tracing::warn!("Account credentials not fully configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_pairs(Vec::<(&str, &str)>::new()).unwrap();

        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 11111);
        assert_eq!(config.gateway.endpoint(), "127.0.0.1:11111");
        assert_eq!(config.trading_env, TradingEnv::Simulate);
        assert_eq!(config.market, Market::Hk);
        assert_eq!(config.quote_interval, Duration::from_secs(3));
        assert!(config.credentials.use_md5);
        assert!(!config.credentials.account_pwd.hashed);
        assert_eq!(config.max_consecutive_failures, 5);
    }

    #[test]
    fn test_full_configuration() {
        let config = AppConfig::from_pairs([
            ("FUTU_OPEND_HOST", "10.0.0.5"),
            ("FUTU_OPEND_PORT", "22222"),
            ("USE_MD5_HASH", "False"),
            ("IS_PASSWORD_HASHED", "t"),
            ("FUTU_ACCOUNT_ID", "281756"),
            ("FUTU_ACCOUNT_PWD", "e10adc3949ba59abbe56e057f20f883e"),
            ("TRADING_ENV", "real"),
            ("DEFAULT_MARKET", "US"),
            ("QUOTE_PUSH_INTERVAL_S", "5"),
            ("MAX_POSITION_QTY", "300"),
            ("ALLOW_SHORT_SELL", "yes"),
        ])
        .unwrap();

        assert_eq!(config.gateway.host, "10.0.0.5");
        assert_eq!(config.gateway.port, 22222);
        assert!(!config.credentials.use_md5);
        assert!(config.credentials.account_pwd.hashed);
        assert_eq!(config.credentials.account_id, "281756");
        assert_eq!(config.trading_env, TradingEnv::Real);
        assert_eq!(config.market, Market::Us);
        assert_eq!(config.quote_interval, Duration::from_secs(5));
        assert_eq!(config.ledger.max_long, 300);
        assert!(config.ledger.allow_short);
    }

    #[test]
    fn test_invalid_trading_env_falls_back() {
        let config = AppConfig::from_pairs([("TRADING_ENV", "PAPER")]).unwrap();
        assert_eq!(config.trading_env, TradingEnv::Simulate);
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let err = AppConfig::from_pairs([("FUTU_OPEND_PORT", "not-a-port")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "FUTU_OPEND_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_market_is_config_error() {
        let err = AppConfig::from_pairs([("DEFAULT_MARKET", "JP")]).unwrap_err();
        assert!(err.to_string().contains("DEFAULT_MARKET"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(AppConfig::from_pairs([("QUOTE_PUSH_INTERVAL_S", "0")]).is_err());
    }

    #[test]
    fn test_zero_base_delay_rejected() {
        let err = AppConfig::from_pairs([("RECONNECT_BASE_DELAY_S", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "RECONNECT_BASE_DELAY_S",
                ..
            }
        ));
    }

    #[test]
    fn test_non_positive_position_cap_rejected() {
        for cap in ["0", "-100"] {
            let err = AppConfig::from_pairs([("MAX_POSITION_QTY", cap)]).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    key: "MAX_POSITION_QTY",
                    ..
                }
            ));
        }
        assert!(AppConfig::from_pairs([("ORDER_QTY", "0")]).is_err());
    }

    #[test]
    fn test_parse_bool() {
        for truthy in ["true", "True", "1", "t", "YES"] {
            assert!(parse_bool(truthy), "{truthy}");
        }
        for falsy in ["false", "0", "no", "", "on"] {
            assert!(!parse_bool(falsy), "{falsy}");
        }
    }
}
