//! Feature Deriver: per-customer RFM, engagement and activity statistics

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{CustomerEvent, CustomerFeatureVector};
use crate::error::ChurnError;

const SCORE_MAX: f64 = 100.0;

/// Weights combining recency, frequency and monetary scores into engagement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementWeights {
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
}

impl Default for EngagementWeights {
    fn default() -> Self {
        Self {
            recency: 0.40,
            frequency: 0.35,
            monetary: 0.25,
        }
    }
}

/// Tunables for the score transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    /// Days of inactivity at which the recency score decays to 100/e
    pub recency_decay_days: f64,
    /// Event count at which the frequency score reaches 100(1 - 1/e)
    pub frequency_scale: f64,
    /// Total spend at which the monetary score reaches 100(1 - 1/e)
    pub monetary_scale: f64,
    /// Bucket width for the activity trend
    pub trend_period_days: u32,
    pub engagement_weights: EngagementWeights,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            recency_decay_days: 90.0,
            frequency_scale: 10.0,
            monetary_scale: 1000.0,
            trend_period_days: 30,
            engagement_weights: EngagementWeights::default(),
        }
    }
}

impl FeatureSettings {
    pub fn validate(&self) -> Result<(), ChurnError> {
        for (name, value) in [
            ("recency_decay_days", self.recency_decay_days),
            ("frequency_scale", self.frequency_scale),
            ("monetary_scale", self.monetary_scale),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ChurnError::validation(format!(
                    "features.{name} must be positive, got {value}"
                )));
            }
        }
        if self.trend_period_days == 0 {
            return Err(ChurnError::validation(
                "features.trend_period_days must be at least 1",
            ));
        }

        let w = self.engagement_weights;
        if [w.recency, w.frequency, w.monetary]
            .iter()
            .any(|weight| !weight.is_finite() || *weight < 0.0)
        {
            return Err(ChurnError::validation(
                "features.engagement_weights must be non-negative",
            ));
        }
        let sum = w.recency + w.frequency + w.monetary;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ChurnError::validation(format!(
                "features.engagement_weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Derives one [`CustomerFeatureVector`] per customer that has events
#[derive(Debug, Clone, Default)]
pub struct FeatureDeriver {
    settings: FeatureSettings,
}

impl FeatureDeriver {
    pub fn new(settings: FeatureSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FeatureSettings {
        &self.settings
    }

    /// Derive vectors as of `as_of`, sorted by customer id.
    ///
    /// Customers are identified by the events themselves, so a customer with
    /// no events never produces a row.
    pub fn derive(
        &self,
        events: &[CustomerEvent],
        as_of: DateTime<Utc>,
    ) -> Vec<CustomerFeatureVector> {
        let mut by_customer: BTreeMap<&str, Vec<&CustomerEvent>> = BTreeMap::new();
        for event in events {
            by_customer
                .entry(event.customer_id.as_str())
                .or_default()
                .push(event);
        }

        by_customer
            .into_iter()
            .filter_map(|(customer_id, mut history)| {
                history.sort_by(|a, b| chronological(a, b));
                self.derive_customer(customer_id, &history, as_of)
            })
            .collect()
    }

    /// Derive one customer's vector from an unordered event set, attributing
    /// every event to `customer_id`
    pub fn derive_for(
        &self,
        customer_id: &str,
        events: &[CustomerEvent],
        as_of: DateTime<Utc>,
    ) -> Option<CustomerFeatureVector> {
        let mut history: Vec<&CustomerEvent> = events.iter().collect();
        history.sort_by(|a, b| chronological(a, b));
        self.derive_customer(customer_id, &history, as_of)
    }

    /// Derive a single customer's vector; `None` when there are no events
    pub fn derive_customer(
        &self,
        customer_id: &str,
        history: &[&CustomerEvent],
        as_of: DateTime<Utc>,
    ) -> Option<CustomerFeatureVector> {
        let first = history.first()?.event_date;
        let last = history.last()?.event_date;
        let reference = as_of.date_naive();
        let count = history.len() as f64;
        let s = &self.settings;

        let days_since_last = (reference - last).num_days().max(0) as f64;
        let recency_score = bounded(SCORE_MAX * (-days_since_last / s.recency_decay_days).exp());
        let frequency_score = bounded(SCORE_MAX * (1.0 - (-count / s.frequency_scale).exp()));

        let amounts: Vec<f64> = history
            .iter()
            .filter_map(|event| event.amount)
            .map(|amount| if amount.is_finite() { amount } else { 0.0 })
            .collect();
        let total: f64 = amounts.iter().sum();
        let monetary_score =
            bounded(SCORE_MAX * (1.0 - (-total.max(0.0) / s.monetary_scale).exp()));
        let avg_transaction_value = if amounts.is_empty() {
            0.0
        } else {
            total / amounts.len() as f64
        };

        let w = s.engagement_weights;
        let engagement_score = bounded(
            w.recency * recency_score + w.frequency * frequency_score + w.monetary * monetary_score,
        );

        let tenure_days = if history.len() >= 2 {
            (last - first).num_days()
        } else {
            (reference - first).num_days().max(0)
        } as f64;

        let days_between_transactions = if history.len() >= 2 {
            (last - first).num_days() as f64 / (count - 1.0)
        } else {
            0.0
        };

        let churn_label = history.iter().rev().find_map(|event| event.churn_label);

        Some(CustomerFeatureVector {
            customer_id: customer_id.to_string(),
            recency_score,
            frequency_score,
            monetary_score,
            engagement_score,
            tenure_days,
            activity_trend: activity_trend(history, first, s.trend_period_days),
            avg_transaction_value,
            days_between_transactions,
            last_event_date: last,
            calculated_at: as_of,
            churn_label,
        })
    }
}

/// Date order, ties broken by amount so equal inputs always sum identically
fn chronological(a: &CustomerEvent, b: &CustomerEvent) -> std::cmp::Ordering {
    a.event_date.cmp(&b.event_date).then_with(|| {
        a.amount
            .unwrap_or(0.0)
            .total_cmp(&b.amount.unwrap_or(0.0))
    })
}

fn bounded(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, SCORE_MAX)
    }
}

/// Least-squares slope of events per period against the period index
fn activity_trend(history: &[&CustomerEvent], first: NaiveDate, period_days: u32) -> f64 {
    let period = i64::from(period_days.max(1));
    let mut counts: Vec<f64> = Vec::new();
    for event in history {
        let bucket = ((event.event_date - first).num_days() / period) as usize;
        if counts.len() <= bucket {
            counts.resize(bucket + 1, 0.0);
        }
        counts[bucket] += 1.0;
    }

    if counts.len() < 2 {
        return 0.0;
    }

    let n = counts.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = counts.iter().sum::<f64>() / n;
    let (mut covariance, mut variance) = (0.0, 0.0);
    for (x, y) in counts.iter().enumerate() {
        let dx = x as f64 - mean_x;
        covariance += dx * (y - mean_y);
        variance += dx * dx;
    }
    covariance / variance
}
