//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use churnwise::features::CustomerEvent;
use churnwise::storage::{MemoryBackend, StorageHandles};
use churnwise::{Pipeline, PipelineConfig};
use std::sync::Arc;

pub fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

pub fn days_ago(days: i64) -> NaiveDate {
    reference_date() - Duration::days(days)
}

/// Config pinned to [`reference_date`], small enough to train on a handful of customers
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::in_memory();
    config.reference_date = Some(reference_date());
    config.default_churn_threshold_days = 30;
    config.training.min_training_rows = 2;
    config
}

pub fn memory_pipeline(config: PipelineConfig) -> (Pipeline, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let pipeline = Pipeline::with_storage(config, StorageHandles::from_backend(backend.clone()))
        .expect("valid test config");
    (pipeline, backend)
}

/// Five purchases over 90 days, the last two days ago
pub fn recent_events() -> Vec<CustomerEvent> {
    [90, 68, 46, 24, 2]
        .into_iter()
        .map(|days| CustomerEvent::new("recent", days_ago(days)).with_amount(80.0))
        .collect()
}

/// A single purchase 200 days ago
pub fn stale_events() -> Vec<CustomerEvent> {
    vec![CustomerEvent::new("stale", days_ago(200)).with_amount(25.0)]
}

/// Raw CSV for the recent, stale and zero-event customers
pub fn three_customer_csv() -> Vec<u8> {
    let mut csv = String::from("customer_id,event_date,amount,event_type\n");
    for event in recent_events().iter().chain(stale_events().iter()) {
        csv.push_str(&format!(
            "{},{},{},purchase\n",
            event.customer_id,
            event.event_date,
            event.amount.unwrap_or_default()
        ));
    }
    csv.push_str("ghost,,,\n");
    csv.into_bytes()
}
