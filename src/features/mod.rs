//! Customer events and the per-customer feature vectors derived from them
//!
//! Raw datasets are CSV tables of transaction/activity events. The deriver
//! folds each customer's events into a fixed-shape [`CustomerFeatureVector`]
//! that the trainer and predictor consume.

pub mod deriver;
pub mod table;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use deriver::{EngagementWeights, FeatureDeriver, FeatureSettings};
pub use table::{parse_events, read_features, write_features, EventTable};

/// Number of model input columns
pub const FEATURE_COUNT: usize = 8;

/// Model input columns, in the order [`CustomerFeatureVector::values`] emits them
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "recency_score",
    "frequency_score",
    "monetary_score",
    "engagement_score",
    "tenure_days",
    "activity_trend",
    "avg_transaction_value",
    "days_between_transactions",
];

/// One transaction or activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerEvent {
    pub customer_id: String,
    pub event_date: NaiveDate,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub churn_label: Option<u8>,
}

impl CustomerEvent {
    pub fn new(customer_id: impl Into<String>, event_date: NaiveDate) -> Self {
        Self {
            customer_id: customer_id.into(),
            event_date,
            amount: None,
            event_type: None,
            churn_label: None,
        }
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Fixed-shape behavioral summary of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFeatureVector {
    pub customer_id: String,
    pub recency_score: f64,
    pub frequency_score: f64,
    pub monetary_score: f64,
    pub engagement_score: f64,
    pub tenure_days: f64,
    pub activity_trend: f64,
    pub avg_transaction_value: f64,
    pub days_between_transactions: f64,
    pub last_event_date: NaiveDate,
    pub calculated_at: DateTime<Utc>,
    /// Label carried over from the raw dataset when it had one
    #[serde(default)]
    pub churn_label: Option<u8>,
}

impl CustomerFeatureVector {
    /// Model inputs in [`FEATURE_COLUMNS`] order
    pub fn values(&self) -> [f64; FEATURE_COUNT] {
        [
            self.recency_score,
            self.frequency_score,
            self.monetary_score,
            self.engagement_score,
            self.tenure_days,
            self.activity_trend,
            self.avg_transaction_value,
            self.days_between_transactions,
        ]
    }
}
