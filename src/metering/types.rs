//! Usage metering data model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{MeteringError, MeteringResult};

/// Opaque key/value metadata merged into usage rows.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Llm,
    Embedding,
    FineTuning,
}

impl TokenType {
    pub const ALL: [TokenType; 3] = [Self::Llm, Self::Embedding, Self::FineTuning];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
            Self::FineTuning => "fine_tuning",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MeteringError::validation(format!("unknown token type '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Query,
    Chat,
    Summarize,
    VectorSearch,
    Generation,
    Classification,
    Extraction,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Self::Query,
        Self::Chat,
        Self::Summarize,
        Self::VectorSearch,
        Self::Generation,
        Self::Classification,
        Self::Extraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Chat => "chat",
            Self::Summarize => "summarize",
            Self::VectorSearch => "vector_search",
            Self::Generation => "generation",
            Self::Classification => "classification",
            Self::Extraction => "extraction",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| MeteringError::validation(format!("unknown operation '{}'", s)))
    }
}

/// Calendar month, rendered `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, MeteringError> {
        if !(1..=12).contains(&month) {
            return Err(MeteringError::validation(format!("month {} out of range", month)));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MeteringError::validation(format!("invalid year-month '{}'", s));
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = MeteringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

/// A fully-resolved usage event ready to be applied to a store.
///
/// `tenant_id` is the billing tenant after attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub idempotency_key: Option<String>,
    pub tenant_id: String,
    pub tokens: u64,
    pub token_type: TokenType,
    pub operation: Operation,
    pub model: String,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

impl UsageEntry {
    pub fn date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }

    pub fn year_month(&self) -> YearMonth {
        YearMonth::of(self.date())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub tenant_id: String,
    pub tokens: u64,
    pub token_type: TokenType,
    pub operation: Operation,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl IdempotencyRecord {
    pub fn from_entry(key: impl Into<String>, entry: &UsageEntry) -> Self {
        Self {
            idempotency_key: key.into(),
            tenant_id: entry.tenant_id.clone(),
            tokens: entry.tokens,
            token_type: entry.token_type,
            operation: entry.operation,
            model: entry.model.clone(),
            created_at: entry.occurred_at,
            metadata: entry.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageRecord {
    pub tenant_id: String,
    pub date: NaiveDate,
    pub token_type: TokenType,
    pub operation: Operation,
    pub model: String,
    pub tokens: u64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyUsageRecord {
    pub tenant_id: String,
    pub year_month: YearMonth,
    pub token_type: TokenType,
    pub tokens: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-tenant running totals.
///
/// `token_usage` and `embedding_token_usage` are the aggregate counters read
/// by older dashboards: LLM and fine-tuning tokens count toward
/// `token_usage`, embedding tokens toward `embedding_token_usage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantUsageSummary {
    pub tenant_id: String,
    pub token_usage: u64,
    pub embedding_token_usage: u64,
    pub llm_tokens: u64,
    pub embedding_tokens: u64,
    pub fine_tuning_tokens: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl TenantUsageSummary {
    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            token_usage: 0,
            embedding_token_usage: 0,
            llm_tokens: 0,
            embedding_tokens: 0,
            fine_tuning_tokens: 0,
            last_activity: None,
        }
    }

    /// Add `tokens` of `token_type`. On overflow nothing is changed.
    pub(crate) fn try_add(
        &mut self,
        token_type: TokenType,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> MeteringResult<()> {
        let mut next = self.clone();
        let (by_type, legacy) = match token_type {
            TokenType::Llm => (&mut next.llm_tokens, &mut next.token_usage),
            TokenType::FineTuning => (&mut next.fine_tuning_tokens, &mut next.token_usage),
            TokenType::Embedding => (&mut next.embedding_tokens, &mut next.embedding_token_usage),
        };
        *by_type = checked_tokens(*by_type, tokens)?;
        *legacy = checked_tokens(*legacy, tokens)?;
        checked_tokens(next.token_usage, next.embedding_token_usage)?;

        next.last_activity = Some(next.last_activity.map_or(at, |prev| prev.max(at)));
        *self = next;
        Ok(())
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            token_usage: self.token_usage,
            embedding_token_usage: self.embedding_token_usage,
            llm_tokens: self.llm_tokens,
            embedding_tokens: self.embedding_tokens,
            fine_tuning_tokens: self.fine_tuning_tokens,
            total_token_usage: self.token_usage.saturating_add(self.embedding_token_usage),
        }
    }
}

/// `current + tokens`, or a validation error when the counter would overflow.
pub(crate) fn checked_tokens(current: u64, tokens: u64) -> MeteringResult<u64> {
    current
        .checked_add(tokens)
        .ok_or_else(|| MeteringError::validation("token counter overflow"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub token_usage: u64,
    pub embedding_token_usage: u64,
    pub llm_tokens: u64,
    pub embedding_tokens: u64,
    pub fine_tuning_tokens: u64,
    pub total_token_usage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Monthly,
}

/// Period label (`YYYY-MM-DD` or `YYYY-MM`) to tokens per type.
pub type UsageBuckets = BTreeMap<String, BTreeMap<TokenType, u64>>;

/// Result of applying one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The idempotency key was already recorded inside the retention window.
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&TokenType::FineTuning).unwrap(),
            "\"fine_tuning\""
        );
        assert_eq!(
            serde_json::to_string(&Operation::VectorSearch).unwrap(),
            "\"vector_search\""
        );
        assert_eq!("embedding".parse::<TokenType>().unwrap(), TokenType::Embedding);
        assert_eq!("extraction".parse::<Operation>().unwrap(), Operation::Extraction);
        assert!("tokens".parse::<TokenType>().is_err());
        assert_eq!(TokenType::default(), TokenType::Llm);
        assert_eq!(Operation::default(), Operation::Query);
    }

    #[test]
    fn test_year_month() {
        let ym: YearMonth = "2025-03".parse().unwrap();
        assert_eq!(ym.to_string(), "2025-03");
        assert_eq!(ym.first_day(), NaiveDate::from_ymd_opt(2025, 3, 1));
        assert!("2025-13".parse::<YearMonth>().is_err());
        assert!("202503".parse::<YearMonth>().is_err());

        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert!(YearMonth::of(date) < ym);
        assert_eq!(serde_json::to_string(&ym).unwrap(), "\"2025-03\"");
    }

    #[test]
    fn test_summary_legacy_counters() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let mut summary = TenantUsageSummary::empty("t1");
        summary.try_add(TokenType::Llm, 100, at).unwrap();
        summary.try_add(TokenType::FineTuning, 10, at).unwrap();
        summary.try_add(TokenType::Embedding, 50, at).unwrap();

        let totals = summary.totals();
        assert_eq!(totals.token_usage, 110);
        assert_eq!(totals.embedding_token_usage, 50);
        assert_eq!(totals.llm_tokens, 100);
        assert_eq!(totals.fine_tuning_tokens, 10);
        assert_eq!(totals.total_token_usage, 160);
        assert_eq!(summary.last_activity, Some(at));
    }

    #[test]
    fn test_summary_overflow_leaves_counters_untouched() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let mut summary = TenantUsageSummary::empty("t1");
        summary.try_add(TokenType::Llm, u64::MAX - 1, at).unwrap();

        let before = summary.clone();
        let later = at + chrono::Duration::hours(1);
        assert!(matches!(
            summary.try_add(TokenType::Llm, 2, later),
            Err(MeteringError::Validation { .. })
        ));
        assert_eq!(summary, before);

        // the legacy total would overflow even though each counter fits
        assert!(summary.try_add(TokenType::Embedding, 2, later).is_err());
        assert_eq!(summary, before);
    }
}
