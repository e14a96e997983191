//! Configuration for folio-bot.
//!
//! Supports loading from a TOML file with environment variable overrides.
//! The raw TOML layer carries floats and strings; conversion into `BotConfig`
//! normalizes every monetary value into `Decimal` so nothing downstream ever
//! touches f64. Invalid ranges are rejected at load time by `validate()`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use folio_common::Venue;

/// Top-level configuration for folio-bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Session database path (SQLite). `sqlite::memory:` for ephemeral runs.
    pub db_path: String,

    /// Symbols to trade.
    pub symbols: Vec<String>,

    /// Logging level.
    pub log_level: String,

    /// Risk parameters.
    pub risk: RiskConfig,

    /// Position sizing parameters.
    pub sizing: SizingConfig,

    /// Execution parameters (venue, fees, slippage, post-only routing).
    pub execution: ExecutionConfig,

    /// Profit realization (bracket) parameters.
    pub realization: RealizationConfig,

    /// Market data decision guards.
    pub market_data: MarketDataConfig,

    /// Exploration budget parameters.
    pub exploration: ExplorationConfig,

    /// Analytics / validation parameters.
    pub analytics: AnalyticsConfig,

    /// Per-symbol overrides.
    pub symbol_overrides: HashMap<String, SymbolConfig>,
}

/// Risk management parameters.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Global shorting permission. Per-symbol `allow_short` is ANDed with this.
    pub short_enabled: bool,

    /// Hard minimum composite score; below this nothing trades.
    pub hard_floor_min: Decimal,

    /// Effective score threshold for NORMAL entries.
    pub effective_threshold: Decimal,

    /// Minimum reward/risk ratio for entries.
    pub rr_min: Decimal,

    /// RR relaxation factor applied to pilot trades (e.g. 0.8 relaxes by 20%).
    pub rr_relax_for_pilot: Decimal,

    /// Fraction of entry price protected by the bracket stop (e.g. 0.02).
    pub bracket_risk_pct: Decimal,

    /// Cycles to block re-entry on a symbol after a stop-loss fill.
    pub sl_cooldown_cycles: u64,

    /// Pyramiding controls.
    pub allow_pyramids: bool,
    pub max_adds: u32,
    /// R-multiple triggers for adds, e.g. [0.7, 1.4].
    pub add_triggers_r: Vec<Decimal>,
    /// Add sizes as fractions of the initial quantity, e.g. [0.7, 0.5].
    pub add_sizes: Vec<Decimal>,
}

/// Position sizing parameters.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Fraction of equity risked per trade (default 0.0025 = 0.25%).
    pub risk_per_trade_pct: Decimal,

    /// Stop distance as a multiple of ATR (default 2.0).
    pub stop_atr_mult: Decimal,

    /// Cap: maximum notional as a fraction of equity.
    pub max_notional_pct: Decimal,

    /// Cap: maximum notional exposure per symbol (USD).
    pub per_symbol_cap: Decimal,

    /// Cap: maximum notional exposure per session (USD).
    pub session_cap: Decimal,

    /// Floor for NORMAL orders (USD).
    pub notional_floor_normal: Decimal,

    /// Floor for exploration orders (USD).
    pub notional_floor_exploration: Decimal,
}

/// Execution parameters.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Default execution venue.
    pub venue: Venue,

    /// Post-only entry routing.
    pub post_only: bool,
    pub post_only_max_wait_seconds: u64,
    pub allow_taker_fallback: bool,

    /// Per-venue fee schedule in basis points.
    pub fees: FeeSchedule,

    /// Slippage model parameters.
    pub slippage: SlippageConfig,
}

/// Maker/taker fee rates in basis points, with per-venue overrides.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub default_maker_bps: Decimal,
    pub default_taker_bps: Decimal,
    pub per_venue: HashMap<Venue, (Decimal, Decimal)>,
}

impl FeeSchedule {
    /// Maker fee in bps for a venue.
    pub fn maker_bps(&self, venue: Venue) -> Decimal {
        self.per_venue
            .get(&venue)
            .map(|(maker, _)| *maker)
            .unwrap_or(self.default_maker_bps)
    }

    /// Taker fee in bps for a venue.
    pub fn taker_bps(&self, venue: Venue) -> Decimal {
        self.per_venue
            .get(&venue)
            .map(|(_, taker)| *taker)
            .unwrap_or(self.default_taker_bps)
    }
}

/// Slippage model: `slip_bps = min((notional / notional_scale) * base_bps, cap_bps)`.
#[derive(Debug, Clone)]
pub struct SlippageConfig {
    pub notional_scale: Decimal,
    pub base_bps: Decimal,
    pub cap_bps: Decimal,
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, Copy)]
pub struct TpRung {
    /// Distance from entry in R-multiples.
    pub r: Decimal,
    /// Fraction of the position closed at this rung.
    pub pct: Decimal,
}

/// Profit realization (bracket) parameters.
#[derive(Debug, Clone)]
pub struct RealizationConfig {
    /// Take-profit ladder, ordered by increasing R.
    pub take_profit_ladder: Vec<TpRung>,

    /// Time stop: bars in trade before a forced close when TP1 has not filled.
    pub max_bars_in_trade: u64,

    /// Wall-clock time stop in hours (backstop for slow bar cadences).
    pub time_stop_hours: u64,
}

/// Market data decision guards.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Maximum acceptable bid/ask spread in bps.
    pub max_spread_bps: Decimal,

    /// Maximum acceptable quote age in milliseconds.
    pub max_quote_age_ms: i64,

    /// Require a live L2 mid (bid and ask both present) to trade.
    pub require_l2_mid: bool,

    /// Minimum edge after costs in bps.
    pub min_edge_bps: Decimal,

    /// Debounce window for snapshot hit logging (milliseconds).
    pub snapshot_debounce_ms: u64,

    /// Base backoff for snapshot fetch retries (milliseconds).
    pub retry_base_ms: u64,
}

/// Exploration budget parameters (PILOT/EXPLORE intents only).
#[derive(Debug, Clone)]
pub struct ExplorationConfig {
    /// Per-day budget as a fraction of equity.
    pub budget_pct: Decimal,

    /// Per-day cap on forced exploration entries.
    pub max_forced_per_day: u32,

    /// Minimum composite score for exploration entries.
    pub min_score: Decimal,

    /// Size multiplier relative to normal sizing.
    pub size_mult_vs_normal: Decimal,
}

/// Analytics / validation parameters.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// NAV validation tolerance in USD (floored at $10 when applied).
    pub nav_validation_tolerance: Decimal,

    /// Base epsilon for commit validation in USD.
    pub commit_base_epsilon: Decimal,
}

/// Per-symbol overrides.
#[derive(Debug, Clone, Default)]
pub struct SymbolConfig {
    pub allow_short: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            db_path: "folio_state.db".to_string(),
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            log_level: "info".to_string(),
            risk: RiskConfig {
                short_enabled: false,
                hard_floor_min: dec!(0.30),
                effective_threshold: dec!(0.55),
                rr_min: dec!(1.2),
                rr_relax_for_pilot: dec!(0.8),
                bracket_risk_pct: dec!(0.02),
                sl_cooldown_cycles: 3,
                allow_pyramids: false,
                max_adds: 2,
                add_triggers_r: vec![dec!(0.7), dec!(1.4)],
                add_sizes: vec![dec!(0.7), dec!(0.5)],
            },
            sizing: SizingConfig {
                risk_per_trade_pct: dec!(0.0025),
                stop_atr_mult: dec!(2.0),
                max_notional_pct: dec!(0.25),
                per_symbol_cap: dec!(25000),
                session_cap: dec!(100000),
                notional_floor_normal: dec!(500),
                notional_floor_exploration: dec!(150),
            },
            execution: ExecutionConfig {
                venue: Venue::Coinbase,
                post_only: false,
                post_only_max_wait_seconds: 5,
                allow_taker_fallback: false,
                fees: FeeSchedule {
                    default_maker_bps: dec!(2),
                    default_taker_bps: dec!(6),
                    per_venue: HashMap::new(),
                },
                slippage: SlippageConfig {
                    notional_scale: dec!(50000),
                    base_bps: dec!(5),
                    cap_bps: dec!(8),
                },
            },
            realization: RealizationConfig {
                take_profit_ladder: vec![
                    TpRung {
                        r: dec!(0.6),
                        pct: dec!(0.40),
                    },
                    TpRung {
                        r: dec!(1.2),
                        pct: dec!(0.40),
                    },
                    TpRung {
                        r: dec!(2.0),
                        pct: dec!(0.20),
                    },
                ],
                max_bars_in_trade: 48,
                time_stop_hours: 48,
            },
            market_data: MarketDataConfig {
                max_spread_bps: dec!(25),
                max_quote_age_ms: 200,
                require_l2_mid: true,
                min_edge_bps: dec!(10),
                snapshot_debounce_ms: 300,
                retry_base_ms: 50,
            },
            exploration: ExplorationConfig {
                budget_pct: dec!(0.02),
                max_forced_per_day: 4,
                min_score: dec!(0.40),
                size_mult_vs_normal: dec!(0.5),
            },
            analytics: AnalyticsConfig {
                nav_validation_tolerance: dec!(10),
                commit_base_epsilon: dec!(0.02),
            },
            symbol_overrides: HashMap::new(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides (database path, log level).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("FOLIO_DB_PATH") {
            self.db_path = db;
        }
        if let Ok(level) = std::env::var("FOLIO_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Whether shorting is allowed for a symbol.
    ///
    /// Requires both the global `short_enabled` switch and the per-symbol
    /// `allow_short` override.
    pub fn shorting_allowed(&self, symbol: &str) -> bool {
        self.risk.short_enabled
            && self
                .symbol_overrides
                .get(symbol)
                .map(|s| s.allow_short)
                .unwrap_or(false)
    }

    /// Validate configuration values. Fails fast on out-of-range settings.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("symbols must not be empty");
        }
        let s = &self.sizing;
        if s.risk_per_trade_pct <= Decimal::ZERO || s.risk_per_trade_pct > dec!(0.03) {
            bail!("risk_per_trade_pct must be in (0, 0.03]");
        }
        if s.max_notional_pct <= Decimal::ZERO || s.max_notional_pct > Decimal::ONE {
            bail!("max_notional_pct must be in (0, 1]");
        }
        if s.stop_atr_mult <= Decimal::ZERO {
            bail!("stop_atr_mult must be positive");
        }
        if s.per_symbol_cap <= Decimal::ZERO || s.session_cap <= Decimal::ZERO {
            bail!("exposure caps must be positive");
        }
        if s.notional_floor_normal < Decimal::ZERO || s.notional_floor_exploration < Decimal::ZERO {
            bail!("notional floors must be non-negative");
        }
        if self.risk.bracket_risk_pct <= Decimal::ZERO || self.risk.bracket_risk_pct >= dec!(0.5) {
            bail!("bracket_risk_pct must be in (0, 0.5)");
        }
        if self.risk.rr_min <= Decimal::ZERO {
            bail!("rr_min must be positive");
        }
        let ladder = &self.realization.take_profit_ladder;
        if ladder.is_empty() {
            bail!("take_profit_ladder must have at least one rung");
        }
        let pct_sum: Decimal = ladder.iter().map(|rung| rung.pct).sum();
        if pct_sum != Decimal::ONE {
            bail!("take_profit_ladder fractions must sum to 1.0, got {}", pct_sum);
        }
        let mut prev_r = Decimal::ZERO;
        for rung in ladder {
            if rung.r <= prev_r {
                bail!("take_profit_ladder R-multiples must be strictly increasing");
            }
            if rung.pct <= Decimal::ZERO || rung.pct > Decimal::ONE {
                bail!("take_profit_ladder fractions must be in (0, 1]");
            }
            prev_r = rung.r;
        }
        if self.realization.max_bars_in_trade == 0 {
            bail!("max_bars_in_trade must be positive");
        }
        let md = &self.market_data;
        if md.max_quote_age_ms <= 0 {
            bail!("max_quote_age_ms must be positive");
        }
        if md.max_spread_bps <= Decimal::ZERO {
            bail!("max_spread_bps must be positive");
        }
        if md.min_edge_bps < Decimal::ZERO {
            bail!("min_edge_bps must be non-negative");
        }
        let ex = &self.exploration;
        if ex.budget_pct < Decimal::ZERO || ex.budget_pct > dec!(0.25) {
            bail!("exploration budget_pct must be in [0, 0.25]");
        }
        if ex.size_mult_vs_normal <= Decimal::ZERO {
            bail!("size_mult_vs_normal must be positive");
        }
        let fees = &self.execution.fees;
        if fees.default_maker_bps < Decimal::ZERO || fees.default_taker_bps < Decimal::ZERO {
            bail!("fee rates must be non-negative");
        }
        let slip = &self.execution.slippage;
        if slip.notional_scale <= Decimal::ZERO
            || slip.base_bps < Decimal::ZERO
            || slip.cap_bps < Decimal::ZERO
        {
            bail!("invalid slippage model parameters");
        }
        if self.analytics.commit_base_epsilon <= Decimal::ZERO {
            bail!("commit_base_epsilon must be positive");
        }
        if self.risk.add_triggers_r.len() < self.risk.max_adds as usize
            && self.risk.allow_pyramids
        {
            bail!("add_triggers_r must cover max_adds entries when pyramiding is enabled");
        }
        Ok(())
    }
}

// =============================================================================
// Raw TOML layer
// =============================================================================

fn f64_to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn pct_to_decimal(pct: f64) -> Decimal {
    f64_to_decimal(pct) / dec!(100)
}

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    general: TomlGeneral,
    #[serde(default)]
    risk: TomlRisk,
    #[serde(default)]
    sizing: TomlSizing,
    #[serde(default)]
    execution: TomlExecution,
    #[serde(default)]
    realization: TomlRealization,
    #[serde(default)]
    market_data: TomlMarketData,
    #[serde(default)]
    exploration: TomlExploration,
    #[serde(default)]
    analytics: TomlAnalytics,
    #[serde(default)]
    symbols: HashMap<String, TomlSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlGeneral {
    db_path: String,
    symbols: Vec<String>,
    log_level: String,
}

impl Default for TomlGeneral {
    fn default() -> Self {
        let defaults = BotConfig::default();
        Self {
            db_path: defaults.db_path,
            symbols: defaults.symbols,
            log_level: defaults.log_level,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlRisk {
    short_enabled: bool,
    hard_floor_min: f64,
    effective_threshold: f64,
    rr_min: f64,
    rr_relax_for_pilot: f64,
    bracket_risk_pct: f64,
    sl_cooldown_cycles: u64,
    allow_pyramids: bool,
    max_adds: u32,
    add_triggers_r: Vec<f64>,
    add_sizes: Vec<f64>,
}

impl Default for TomlRisk {
    fn default() -> Self {
        Self {
            short_enabled: false,
            hard_floor_min: 0.30,
            effective_threshold: 0.55,
            rr_min: 1.2,
            rr_relax_for_pilot: 0.8,
            bracket_risk_pct: 2.0,
            sl_cooldown_cycles: 3,
            allow_pyramids: false,
            max_adds: 2,
            add_triggers_r: vec![0.7, 1.4],
            add_sizes: vec![0.7, 0.5],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlSizing {
    risk_per_trade_pct: f64,
    stop_atr_mult: f64,
    max_notional_pct: f64,
    per_symbol_cap: f64,
    session_cap: f64,
    notional_floor_normal: f64,
    notional_floor_exploration: f64,
}

impl Default for TomlSizing {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 0.25,
            stop_atr_mult: 2.0,
            max_notional_pct: 25.0,
            per_symbol_cap: 25000.0,
            session_cap: 100000.0,
            notional_floor_normal: 500.0,
            notional_floor_exploration: 150.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlExecution {
    venue: String,
    post_only: bool,
    post_only_max_wait_seconds: u64,
    allow_taker_fallback: bool,
    maker_bps: f64,
    taker_bps: f64,
    venue_fees: HashMap<String, TomlVenueFees>,
    slippage_notional_scale: f64,
    slippage_base_bps: f64,
    slippage_cap_bps: f64,
}

#[derive(Debug, Deserialize)]
struct TomlVenueFees {
    maker_bps: f64,
    taker_bps: f64,
}

impl Default for TomlExecution {
    fn default() -> Self {
        Self {
            venue: "coinbase".to_string(),
            post_only: false,
            post_only_max_wait_seconds: 5,
            allow_taker_fallback: false,
            maker_bps: 2.0,
            taker_bps: 6.0,
            venue_fees: HashMap::new(),
            slippage_notional_scale: 50000.0,
            slippage_base_bps: 5.0,
            slippage_cap_bps: 8.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlRealization {
    take_profit_ladder: Vec<TomlTpRung>,
    max_bars_in_trade: u64,
    time_stop_hours: u64,
}

#[derive(Debug, Deserialize)]
struct TomlTpRung {
    r: f64,
    pct: f64,
}

impl Default for TomlRealization {
    fn default() -> Self {
        Self {
            take_profit_ladder: vec![
                TomlTpRung { r: 0.6, pct: 0.40 },
                TomlTpRung { r: 1.2, pct: 0.40 },
                TomlTpRung { r: 2.0, pct: 0.20 },
            ],
            max_bars_in_trade: 48,
            time_stop_hours: 48,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlMarketData {
    max_spread_bps: f64,
    max_quote_age_ms: i64,
    require_l2_mid: bool,
    min_edge_bps: f64,
    snapshot_debounce_ms: u64,
    retry_base_ms: u64,
}

impl Default for TomlMarketData {
    fn default() -> Self {
        Self {
            max_spread_bps: 25.0,
            max_quote_age_ms: 200,
            require_l2_mid: true,
            min_edge_bps: 10.0,
            snapshot_debounce_ms: 300,
            retry_base_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlExploration {
    budget_pct: f64,
    max_forced_per_day: u32,
    min_score: f64,
    size_mult_vs_normal: f64,
}

impl Default for TomlExploration {
    fn default() -> Self {
        Self {
            budget_pct: 2.0,
            max_forced_per_day: 4,
            min_score: 0.40,
            size_mult_vs_normal: 0.5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TomlAnalytics {
    nav_validation_tolerance: f64,
    commit_base_epsilon: f64,
}

impl Default for TomlAnalytics {
    fn default() -> Self {
        Self {
            nav_validation_tolerance: 10.0,
            commit_base_epsilon: 0.02,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TomlSymbol {
    allow_short: bool,
}

impl From<TomlConfig> for BotConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut per_venue = HashMap::new();
        for (name, fees) in &toml.execution.venue_fees {
            if let Ok(venue) = name.parse::<Venue>() {
                per_venue.insert(
                    venue,
                    (f64_to_decimal(fees.maker_bps), f64_to_decimal(fees.taker_bps)),
                );
            }
        }

        let symbol_overrides = toml
            .symbols
            .iter()
            .map(|(symbol, cfg)| {
                (
                    symbol.clone(),
                    SymbolConfig {
                        allow_short: cfg.allow_short,
                    },
                )
            })
            .collect();

        Self {
            db_path: toml.general.db_path,
            symbols: toml.general.symbols,
            log_level: toml.general.log_level,
            risk: RiskConfig {
                short_enabled: toml.risk.short_enabled,
                hard_floor_min: f64_to_decimal(toml.risk.hard_floor_min),
                effective_threshold: f64_to_decimal(toml.risk.effective_threshold),
                rr_min: f64_to_decimal(toml.risk.rr_min),
                rr_relax_for_pilot: f64_to_decimal(toml.risk.rr_relax_for_pilot),
                bracket_risk_pct: pct_to_decimal(toml.risk.bracket_risk_pct),
                sl_cooldown_cycles: toml.risk.sl_cooldown_cycles,
                allow_pyramids: toml.risk.allow_pyramids,
                max_adds: toml.risk.max_adds,
                add_triggers_r: toml.risk.add_triggers_r.iter().copied().map(f64_to_decimal).collect(),
                add_sizes: toml.risk.add_sizes.iter().copied().map(f64_to_decimal).collect(),
            },
            sizing: SizingConfig {
                risk_per_trade_pct: pct_to_decimal(toml.sizing.risk_per_trade_pct),
                stop_atr_mult: f64_to_decimal(toml.sizing.stop_atr_mult),
                max_notional_pct: pct_to_decimal(toml.sizing.max_notional_pct),
                per_symbol_cap: f64_to_decimal(toml.sizing.per_symbol_cap),
                session_cap: f64_to_decimal(toml.sizing.session_cap),
                notional_floor_normal: f64_to_decimal(toml.sizing.notional_floor_normal),
                notional_floor_exploration: f64_to_decimal(toml.sizing.notional_floor_exploration),
            },
            execution: ExecutionConfig {
                venue: toml.execution.venue.parse().unwrap_or(Venue::Coinbase),
                post_only: toml.execution.post_only,
                post_only_max_wait_seconds: toml.execution.post_only_max_wait_seconds,
                allow_taker_fallback: toml.execution.allow_taker_fallback,
                fees: FeeSchedule {
                    default_maker_bps: f64_to_decimal(toml.execution.maker_bps),
                    default_taker_bps: f64_to_decimal(toml.execution.taker_bps),
                    per_venue,
                },
                slippage: SlippageConfig {
                    notional_scale: f64_to_decimal(toml.execution.slippage_notional_scale),
                    base_bps: f64_to_decimal(toml.execution.slippage_base_bps),
                    cap_bps: f64_to_decimal(toml.execution.slippage_cap_bps),
                },
            },
            realization: RealizationConfig {
                take_profit_ladder: toml
                    .realization
                    .take_profit_ladder
                    .iter()
                    .map(|rung| TpRung {
                        r: f64_to_decimal(rung.r),
                        pct: f64_to_decimal(rung.pct),
                    })
                    .collect(),
                max_bars_in_trade: toml.realization.max_bars_in_trade,
                time_stop_hours: toml.realization.time_stop_hours,
            },
            market_data: MarketDataConfig {
                max_spread_bps: f64_to_decimal(toml.market_data.max_spread_bps),
                max_quote_age_ms: toml.market_data.max_quote_age_ms,
                require_l2_mid: toml.market_data.require_l2_mid,
                min_edge_bps: f64_to_decimal(toml.market_data.min_edge_bps),
                snapshot_debounce_ms: toml.market_data.snapshot_debounce_ms,
                retry_base_ms: toml.market_data.retry_base_ms,
            },
            exploration: ExplorationConfig {
                budget_pct: pct_to_decimal(toml.exploration.budget_pct),
                max_forced_per_day: toml.exploration.max_forced_per_day,
                min_score: f64_to_decimal(toml.exploration.min_score),
                size_mult_vs_normal: f64_to_decimal(toml.exploration.size_mult_vs_normal),
            },
            analytics: AnalyticsConfig {
                nav_validation_tolerance: f64_to_decimal(toml.analytics.nav_validation_tolerance),
                commit_base_epsilon: f64_to_decimal(toml.analytics.commit_base_epsilon),
            },
            symbol_overrides,
        }
    }
}
