//! CSV codecs for raw event tables and derived feature tables

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::debug;

use super::{CustomerEvent, CustomerFeatureVector};
use crate::error::ChurnError;

const CUSTOMER_ID: &str = "customer_id";
const EVENT_DATE: &str = "event_date";
const AMOUNT: &str = "amount";
const EVENT_TYPE: &str = "event_type";
const CHURN_LABEL: &str = "churn_label";

/// A parsed raw dataset
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    /// Every customer id seen, in first-seen order, including customers
    /// whose rows carried no usable event date
    pub customers: Vec<String>,
    pub events: Vec<CustomerEvent>,
    /// Data rows in the file, excluding the header
    pub row_count: usize,
    pub has_churn_label: bool,
}

impl EventTable {
    /// Most recent event date per customer; `None` for customers without events
    pub fn last_event_dates(&self) -> BTreeMap<&str, Option<NaiveDate>> {
        let mut dates: BTreeMap<&str, Option<NaiveDate>> = self
            .customers
            .iter()
            .map(|customer| (customer.as_str(), None))
            .collect();
        for event in &self.events {
            let entry = dates.entry(event.customer_id.as_str()).or_insert(None);
            if entry.map_or(true, |seen| event.event_date > seen) {
                *entry = Some(event.event_date);
            }
        }
        dates
    }
}

#[derive(Debug)]
struct Columns {
    customer_id: usize,
    event_date: usize,
    amount: Option<usize>,
    event_type: Option<usize>,
    churn_label: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, ChurnError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(name))
        };
        let required = |name: &str| {
            find(name).ok_or_else(|| {
                ChurnError::validation(format!("CSV is missing required column '{name}'"))
            })
        };

        Ok(Self {
            customer_id: required(CUSTOMER_ID)?,
            event_date: required(EVENT_DATE)?,
            amount: find(AMOUNT),
            event_type: find(EVENT_TYPE),
            churn_label: find(CHURN_LABEL),
        })
    }
}

/// Parse a raw events CSV.
///
/// Unparsable dates register the customer without an event; unparsable
/// amounts become 0. Rows are never dropped for bad values, only for a blank
/// customer id.
pub fn parse_events(bytes: &[u8]) -> Result<EventTable, ChurnError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);
    let columns = Columns::locate(reader.headers()?)?;

    let mut table = EventTable {
        has_churn_label: columns.churn_label.is_some(),
        ..EventTable::default()
    };
    let mut seen = std::collections::HashSet::new();

    for record in reader.records() {
        let record = record?;
        table.row_count += 1;
        let field = |index: Option<usize>| {
            index
                .and_then(|i| record.get(i))
                .filter(|value| !value.is_empty())
        };

        let Some(customer_id) = field(Some(columns.customer_id)) else {
            debug!(row = table.row_count, "skipping row without customer_id");
            continue;
        };
        if seen.insert(customer_id.to_string()) {
            table.customers.push(customer_id.to_string());
        }

        let Some(event_date) = field(Some(columns.event_date)).and_then(parse_date) else {
            continue;
        };

        let amount = field(columns.amount).map(|raw| {
            raw.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .unwrap_or(0.0)
        });

        table.events.push(CustomerEvent {
            customer_id: customer_id.to_string(),
            event_date,
            amount,
            event_type: field(columns.event_type).map(str::to_string),
            churn_label: field(columns.churn_label).and_then(parse_label),
        });
    }

    Ok(table)
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and RFC 3339
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn parse_label(raw: &str) -> Option<u8> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" | "yes" => Some(1),
        "0" | "0.0" | "false" | "no" => Some(0),
        _ => None,
    }
}

/// Serialize a feature table
pub fn write_features(vectors: &[CustomerFeatureVector]) -> Result<Vec<u8>, ChurnError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for vector in vectors {
        writer.serialize(vector)?;
    }
    writer
        .into_inner()
        .map_err(|e| ChurnError::internal(format!("failed to flush feature table: {e}")))
}

/// Deserialize a feature table written by [`write_features`]
pub fn read_features(bytes: &[u8]) -> Result<Vec<CustomerFeatureVector>, ChurnError> {
    csv::Reader::from_reader(bytes)
        .deserialize()
        .collect::<Result<Vec<CustomerFeatureVector>, csv::Error>>()
        .map_err(ChurnError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDeriver;
    use chrono::{TimeZone, Utc};

    const RAW: &str = "\
customer_id,event_date,amount,event_type
alice,2024-05-01,10.5,purchase
alice,2024-05-20T10:00:00Z,oops,purchase
bob,2023-11-14 08:30:00,,login
carol,,,
,2024-01-01,5,purchase
";

    #[test]
    fn test_parse_events_coerces_bad_values() {
        let table = parse_events(RAW.as_bytes()).unwrap();

        assert_eq!(table.row_count, 5);
        assert_eq!(table.customers, vec!["alice", "bob", "carol"]);
        assert_eq!(table.events.len(), 3);
        assert!(!table.has_churn_label);

        assert_eq!(table.events[0].amount, Some(10.5));
        assert_eq!(table.events[1].amount, Some(0.0));
        assert_eq!(
            table.events[1].event_date,
            NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()
        );
        assert_eq!(table.events[2].amount, None);
        assert_eq!(table.events[2].event_type.as_deref(), Some("login"));

        let last = table.last_event_dates();
        assert_eq!(last["carol"], None);
        assert_eq!(last["alice"], NaiveDate::from_ymd_opt(2024, 5, 20));
    }

    #[test]
    fn test_missing_required_column_is_rejected() {
        let err = parse_events(b"customer,amount\na,1\n").unwrap_err();
        assert!(matches!(err, ChurnError::Validation { .. }));
        assert!(err.to_string().contains("customer_id"));
    }

    #[test]
    fn test_headers_are_case_insensitive_and_labels_parse() {
        let table =
            parse_events(b"Customer_ID,Event_Date,Churn_Label\na,2024-01-01,1\nb,2024-01-02,false\n")
                .unwrap();
        assert!(table.has_churn_label);
        assert_eq!(table.events[0].churn_label, Some(1));
        assert_eq!(table.events[1].churn_label, Some(0));
    }

    #[test]
    fn test_feature_table_roundtrip() {
        let table = parse_events(RAW.as_bytes()).unwrap();
        let as_of = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let vectors = FeatureDeriver::default().derive(&table.events, as_of);

        let bytes = write_features(&vectors).unwrap();
        let header = String::from_utf8(bytes.clone()).unwrap();
        assert!(header.starts_with("customer_id,recency_score,frequency_score"));

        assert_eq!(read_features(&bytes).unwrap(), vectors);
    }

    #[test]
    fn test_empty_feature_table() {
        let bytes = write_features(&[]).unwrap();
        assert!(read_features(&bytes).unwrap().is_empty());
    }
}
