//! Labeler: inactivity threshold to binary churn label

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::features::EventTable;

pub const CHURNED: u8 = 1;
pub const ACTIVE: u8 = 0;

/// Churn label for one customer.
///
/// No activity at all counts as churned; otherwise a customer is churned once
/// `reference_date - last_event_date` reaches `threshold_days`.
pub fn label(
    last_event_date: Option<NaiveDate>,
    threshold_days: u32,
    reference_date: NaiveDate,
) -> u8 {
    match last_event_date {
        None => CHURNED,
        Some(last) if (reference_date - last).num_days() >= i64::from(threshold_days) => CHURNED,
        Some(_) => ACTIVE,
    }
}

/// Labels for every customer in a raw table, keyed by customer id
pub fn label_customers(
    table: &EventTable,
    threshold_days: u32,
    reference_date: NaiveDate,
) -> BTreeMap<String, u8> {
    table
        .last_event_dates()
        .into_iter()
        .map(|(customer, last)| {
            (
                customer.to_string(),
                label(last, threshold_days, reference_date),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::parse_events;
    use chrono::Duration;
    use proptest::prelude::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_threshold_boundary_is_churned() {
        let r = reference();
        assert_eq!(label(Some(r - Duration::days(30)), 30, r), CHURNED);
        assert_eq!(label(Some(r - Duration::days(29)), 30, r), ACTIVE);
        assert_eq!(label(Some(r), 0, r), CHURNED);
    }

    #[test]
    fn test_label_customers_includes_silent_customers() {
        let table = parse_events(
            b"customer_id,event_date\nrecent,2024-05-30\nstale,2023-11-14\nsilent,\n",
        )
        .unwrap();

        let labels = label_customers(&table, 30, reference());
        assert_eq!(labels["recent"], ACTIVE);
        assert_eq!(labels["stale"], CHURNED);
        assert_eq!(labels["silent"], CHURNED);
    }

    proptest! {
        #[test]
        fn prop_no_activity_is_churned(threshold in 0u32..10_000, offset in -20_000i64..20_000) {
            let r = reference() + Duration::days(offset);
            prop_assert_eq!(label(None, threshold, r), CHURNED);
        }

        #[test]
        fn prop_label_matches_elapsed_days(threshold in 0u32..1_000, age in -100i64..2_000) {
            let r = reference();
            let expected = if age >= i64::from(threshold) { CHURNED } else { ACTIVE };
            prop_assert_eq!(label(Some(r - Duration::days(age)), threshold, r), expected);
        }
    }
}
