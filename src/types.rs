use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration stored in ~/.churnwatch/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub source: SourceConfig,
    /// Time-to-live for cached member lists, stats and analytics snapshots.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Upper bound on a single upstream fetch before the request fails.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Background refresh interval. 0 disables the refresh loop.
    #[serde(default = "default_refresh_interval_minutes")]
    pub refresh_interval_minutes: u64,
    /// IANA timezone the gym's wall clock runs in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_phone_country_code")]
    pub phone_country_code: String,
    /// Lowercase substrings identifying introductory/trial products.
    #[serde(default = "default_trial_keywords")]
    pub trial_keywords: Vec<String>,
    /// First day of the LTV accounting window.
    #[serde(default = "default_ltv_window_start")]
    pub ltv_window_start: NaiveDate,
    /// Trailing window for visit fetching and the check-in distribution.
    #[serde(default = "default_visit_lookback_days")]
    pub visit_lookback_days: i64,
    #[serde(default = "default_outreach_daily_limit")]
    pub outreach_daily_limit: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Which upstream provider feeds the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceConfig {
    Sheet(SheetSourceConfig),
    Api(ApiSourceConfig),
}

/// Flat tabular export. Each table is an http(s) URL to a published CSV or a
/// local .csv/.xlsx/.xls/.ods path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSourceConfig {
    pub members: String,
    pub visits: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments: Option<String>,
}

/// Paginated REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSourceConfig {
    pub base_url: String,
    /// Falls back to `CHURNWATCH_API_TOKEN` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_max_concurrent_pages")]
    pub max_concurrent_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_refresh_interval_minutes() -> u64 {
    15
}

fn default_timezone() -> String {
    "Europe/Amsterdam".to_string()
}

fn default_phone_country_code() -> String {
    "31".to_string()
}

fn default_trial_keywords() -> Vec<String> {
    vec![
        "kennismaking".to_string(),
        "proef".to_string(),
        "trial".to_string(),
    ]
}

fn default_ltv_window_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

fn default_visit_lookback_days() -> i64 {
    90
}

fn default_outreach_daily_limit() -> usize {
    10
}

fn default_per_page() -> u32 {
    1000
}

fn default_max_concurrent_pages() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Config {
    /// Config with defaults for everything but the source.
    pub fn with_source(source: SourceConfig) -> Self {
        Self {
            source,
            cache_ttl_secs: default_cache_ttl_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            refresh_interval_minutes: default_refresh_interval_minutes(),
            timezone: default_timezone(),
            phone_country_code: default_phone_country_code(),
            trial_keywords: default_trial_keywords(),
            ltv_window_start: default_ltv_window_start(),
            visit_lookback_days: default_visit_lookback_days(),
            outreach_daily_limit: default_outreach_daily_limit(),
            retry: RetryConfig::default(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn tz(&self) -> Result<Tz, EngineError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| EngineError::Configuration(format!("Unknown timezone: {}", self.timezone)))
    }

    /// Fail fast on settings that would otherwise break inside a fetch.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.tz()?;
        if self.cache_ttl_secs == 0 {
            return Err(EngineError::Configuration(
                "cacheTtlSecs must be greater than 0".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "fetchTimeoutSecs must be greater than 0".to_string(),
            ));
        }
        if self.visit_lookback_days < 30 {
            return Err(EngineError::Configuration(
                "visitLookbackDays must cover at least 30 days".to_string(),
            ));
        }
        if !self.phone_country_code.chars().all(|c| c.is_ascii_digit())
            || self.phone_country_code.is_empty()
        {
            return Err(EngineError::Configuration(format!(
                "phoneCountryCode must be digits only, got {:?}",
                self.phone_country_code
            )));
        }
        match &self.source {
            SourceConfig::Sheet(sheet) => {
                if sheet.members.trim().is_empty() || sheet.visits.trim().is_empty() {
                    return Err(EngineError::Configuration(
                        "sheet source needs both a members and a visits table".to_string(),
                    ));
                }
            }
            SourceConfig::Api(api) => {
                if api.base_url.trim().is_empty() {
                    return Err(EngineError::Configuration(
                        "api source needs a baseUrl".to_string(),
                    ));
                }
                if api.per_page == 0 || api.max_concurrent_pages == 0 {
                    return Err(EngineError::Configuration(
                        "perPage and maxConcurrentPages must be greater than 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Canonical data model
// =============================================================================

/// Risk band, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// High and critical members are the outreach population.
    pub fn is_at_risk(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// One explainable contribution to a risk score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    pub code: String,
    pub label: String,
    pub points: u8,
}

/// Score, band and the ordered factor list. Always replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: u8,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

/// An active customer with its activity summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub member_ref: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    /// Deduplicated, in first-seen order.
    pub active_products: Vec<String>,
    pub nominal_fee_total: f64,
    pub status: String,
    pub member_since: Option<NaiveDateTime>,
    pub last_visit: Option<NaiveDateTime>,
    #[serde(rename = "visits30d")]
    pub visits_30d: u32,
    #[serde(rename = "visits90d")]
    pub visits_90d: u32,
    pub risk_assessment: RiskAssessment,
    pub ltv: f64,
    pub payment_count: u32,
    pub last_payment_date: Option<NaiveDate>,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A recorded attendance attributed to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitEvent {
    pub member_ref: String,
    pub occurred_at: NaiveDateTime,
}

/// A booking as reported upstream, attended or not.
///
/// One booked place in a session, counted once per session no matter how
/// many members it resolves to.
///
/// `member_refs` holds the direct ref, or every active member whose name
/// matches a name-only row, the same members credited with the visit.
/// Empty when nothing matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub member_refs: Vec<String>,
    pub session_key: String,
    pub occurred_at: NaiveDateTime,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub member_ref: String,
    pub amount: f64,
    pub paid_at: NaiveDate,
    pub status: String,
}

impl PaymentEvent {
    /// Only paid/completed payments count toward LTV.
    pub fn is_settled(&self) -> bool {
        let status = self.status.trim().to_lowercase();
        matches!(status.as_str(), "paid" | "completed" | "betaald" | "voldaan")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Ended,
}

impl SubscriptionStatus {
    /// Map an upstream status word; `None` for statuses that are neither
    /// running nor finished (planned, paused, ...).
    pub fn classify(raw: &str) -> Option<Self> {
        let status = raw.trim().to_lowercase();
        match status.as_str() {
            "actief" | "active" => Some(SubscriptionStatus::Active),
            "expired" | "cancelled" | "canceled" | "ended" | "beeindigd" | "beëindigd"
            | "inactief" | "inactive" | "verlopen" => Some(SubscriptionStatus::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSubscription {
    pub member_ref: String,
    pub product_name: String,
    pub status: SubscriptionStatus,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub price: f64,
}

// =============================================================================
// Caller-facing shapes
// =============================================================================

/// Member list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberFilter {
    All,
    AtRisk,
    Critical,
}

impl MemberFilter {
    pub fn matches(&self, member: &Member) -> bool {
        match self {
            MemberFilter::All => true,
            MemberFilter::AtRisk => member.risk_assessment.level.is_at_risk(),
            MemberFilter::Critical => member.risk_assessment.level == RiskLevel::Critical,
        }
    }
}

impl FromStr for MemberFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(MemberFilter::All),
            "at-risk" | "at_risk" | "atrisk" => Ok(MemberFilter::AtRisk),
            "critical" => Ok(MemberFilter::Critical),
            other => Err(EngineError::InvalidRequest(format!(
                "Unknown member filter: {}",
                other
            ))),
        }
    }
}

/// Summary counters for the dashboard header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_members: usize,
    pub at_risk: usize,
    pub critical_risk: usize,
    pub avg_checkins_per_week: f64,
    #[serde(rename = "totalLTV")]
    pub total_ltv: i64,
    #[serde(rename = "avgLTV")]
    pub avg_ltv: i64,
    pub members_with_payments: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str(
            r#"{ "source": { "kind": "api", "baseUrl": "https://api.example.com/tenant/gym" } }"#,
        )
        .unwrap();
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.timezone, "Europe/Amsterdam");
        assert_eq!(config.trial_keywords, vec!["kennismaking", "proef", "trial"]);
        assert_eq!(
            config.ltv_window_start,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        assert_eq!(config.retry.max_attempts, 3);
        match config.source {
            SourceConfig::Api(api) => {
                assert_eq!(api.per_page, 1000);
                assert_eq!(api.max_concurrent_pages, 4);
                assert!(api.api_token.is_none());
            }
            other => panic!("expected api source, got {:?}", other),
        }
    }

    #[test]
    fn test_sheet_source_deserializes() {
        let config: Config = serde_json::from_str(
            r#"{
                "source": { "kind": "sheet", "members": "leden.csv", "visits": "checkins.csv" },
                "cacheTtlSecs": 60
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache_ttl_secs, 60);
        assert!(matches!(config.source, SourceConfig::Sheet(ref s) if s.payments.is_none()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timezone() {
        let mut config = Config::with_source(SourceConfig::Sheet(SheetSourceConfig {
            members: "m.csv".to_string(),
            visits: "v.csv".to_string(),
            payments: None,
        }));
        config.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttl_and_missing_base_url() {
        let mut config = Config::with_source(SourceConfig::Api(ApiSourceConfig {
            base_url: "  ".to_string(),
            api_token: Some("t".to_string()),
            per_page: 100,
            max_concurrent_pages: 2,
        }));
        assert!(config.validate().is_err());

        if let SourceConfig::Api(ref mut api) = config.source {
            api.base_url = "https://api.example.com".to_string();
        }
        assert!(config.validate().is_ok());
        config.cache_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscription_status_classify() {
        assert_eq!(SubscriptionStatus::classify("Actief"), Some(SubscriptionStatus::Active));
        assert_eq!(SubscriptionStatus::classify(" ACTIVE "), Some(SubscriptionStatus::Active));
        assert_eq!(SubscriptionStatus::classify("expired"), Some(SubscriptionStatus::Ended));
        assert_eq!(SubscriptionStatus::classify("Canceled"), Some(SubscriptionStatus::Ended));
        assert_eq!(SubscriptionStatus::classify("planned"), None);
        assert_eq!(SubscriptionStatus::classify(""), None);
    }

    #[test]
    fn test_member_filter_parse() {
        assert_eq!("all".parse::<MemberFilter>().unwrap(), MemberFilter::All);
        assert_eq!("at-risk".parse::<MemberFilter>().unwrap(), MemberFilter::AtRisk);
        assert_eq!("Critical".parse::<MemberFilter>().unwrap(), MemberFilter::Critical);
        assert!("everyone".parse::<MemberFilter>().is_err());
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert!(RiskLevel::High.is_at_risk());
        assert!(!RiskLevel::Medium.is_at_risk());
    }

    #[test]
    fn test_payment_settled_statuses() {
        let mut payment = PaymentEvent {
            member_ref: "K1".to_string(),
            amount: 10.0,
            paid_at: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            status: "Paid".to_string(),
        };
        assert!(payment.is_settled());
        payment.status = "planned".to_string();
        assert!(!payment.is_settled());
    }
}
