//! Stage bodies
//!
//! Each function does the work of one pipeline step and returns a `Result`.
//! Status bookkeeping (claiming, completing and failing records) belongs to
//! the orchestrator, which also decides whether an error reaches the caller.

use tracing::{debug, info, warn};

use super::StageContext;
use crate::error::ChurnError;
use crate::features::{parse_events, read_features, write_features, CustomerFeatureVector};
use crate::labeling::{label, label_customers};
use crate::model::{Algorithm, LabeledRow, TrainingMetrics};
use crate::storage::{
    DatasetFilter, DatasetId, DatasetKind, DatasetStatus, MetadataSession, OrgId,
    Organization, RawDataset,
};

/// Bucket holding uploaded raw event tables
pub const DATASETS_BUCKET: &str = "datasets";
/// Bucket holding derived feature tables
pub const FEATURES_BUCKET: &str = "features";

pub(crate) fn raw_folder(org_id: &OrgId) -> String {
    format!("org_{org_id}/raw")
}

fn features_folder(dataset: &RawDataset) -> String {
    format!("org_{}/features", dataset.organization_id)
}

/// What a successful training stage hands back for the run record
#[derive(Debug)]
pub(crate) struct TrainingOutcome {
    pub model_path: String,
    pub metrics: TrainingMetrics,
}

/// Derive features from `raw` and persist them as a new `ready` dataset.
///
/// Feature blobs are append-only: every invocation writes a fresh blob and
/// record, so earlier feature datasets stay readable.
pub(crate) async fn derive_features(
    ctx: &StageContext,
    session: &MetadataSession,
    raw: &RawDataset,
) -> Result<RawDataset, ChurnError> {
    let bytes = ctx.storage.blobs.get(&raw.blob.bucket, &raw.blob.path).await?;
    let table = parse_events(&bytes)?;

    let vectors = ctx.deriver.derive(&table.events, ctx.config.as_of());
    let skipped = table.customers.len().saturating_sub(vectors.len());
    if skipped > 0 {
        debug!(
            dataset_id = %raw.id,
            skipped,
            "customers without dated events produce no feature row"
        );
    }

    let labeled = table.has_churn_label
        && !vectors.is_empty()
        && vectors.iter().all(|vector| vector.churn_label.is_some());
    let csv = write_features(&vectors)?;

    let features_id = DatasetId::new();
    let name = format!("features_{}_{}.csv", raw.id, features_id);
    let blob = ctx
        .storage
        .blobs
        .put(csv, FEATURES_BUCKET, &features_folder(raw), Some(&name))
        .await?;

    let features = RawDataset {
        id: features_id,
        organization_id: raw.organization_id,
        kind: DatasetKind::Features,
        blob,
        row_count: vectors.len(),
        has_churn_label: labeled,
        status: DatasetStatus::Ready,
        source_dataset_id: Some(raw.id),
        error_message: None,
        created_at: chrono::Utc::now(),
    };
    session.save_dataset(&features).await?;

    info!(
        org_id = %raw.organization_id,
        dataset_id = %raw.id,
        features_dataset_id = %features.id,
        rows = features.row_count,
        "feature table written"
    );
    Ok(features)
}

/// Fit `algorithm` on the organization's latest features and persist the model
pub(crate) async fn train_model(
    ctx: &StageContext,
    session: &MetadataSession,
    organization: &Organization,
    algorithm: Algorithm,
) -> Result<TrainingOutcome, ChurnError> {
    let rows = labeled_rows(ctx, session, organization).await?;
    debug!(org_id = %organization.id, rows = rows.len(), %algorithm, "fitting model");

    let trainer = ctx.trainer.clone();
    let (model, metrics) = tokio::task::spawn_blocking(move || trainer.train(&rows, algorithm))
        .await
        .map_err(|e| ChurnError::internal(format!("training task aborted: {e}")))??;

    let location = ctx.artifacts.save(&organization.id, &model).await?;
    Ok(TrainingOutcome {
        model_path: location.location,
        metrics,
    })
}

/// The latest `ready` features dataset for an organization
pub(crate) async fn latest_features(
    ctx: &StageContext,
    session: &MetadataSession,
    organization: &Organization,
) -> Result<(RawDataset, Vec<CustomerFeatureVector>), ChurnError> {
    let filter = DatasetFilter::new(organization.id)
        .kind(DatasetKind::Features)
        .statuses(&[DatasetStatus::Ready]);
    let dataset = session
        .latest_dataset(&filter)
        .await?
        .ok_or_else(|| ChurnError::NotFound {
            message: "No features dataset found".to_string(),
        })?;

    let bytes = ctx
        .storage
        .blobs
        .get(&dataset.blob.bucket, &dataset.blob.path)
        .await?;
    let vectors = read_features(&bytes)?;
    Ok((dataset, vectors))
}

/// Pair each feature row with a churn label.
///
/// Labels embedded in the features dataset win; otherwise they come from the
/// latest usable raw dataset and the organization's threshold.
async fn labeled_rows(
    ctx: &StageContext,
    session: &MetadataSession,
    organization: &Organization,
) -> Result<Vec<LabeledRow>, ChurnError> {
    let (features, vectors) = latest_features(ctx, session, organization).await?;
    if features.has_churn_label {
        return vectors
            .into_iter()
            .map(|vector| match vector.churn_label {
                Some(churn_label) => Ok(LabeledRow {
                    features: vector,
                    churn_label,
                }),
                None => Err(ChurnError::validation(format!(
                    "features dataset {} is missing a label for customer {}",
                    features.id, vector.customer_id
                ))),
            })
            .collect();
    }

    let filter = DatasetFilter::new(organization.id)
        .kind(DatasetKind::Raw)
        .statuses(&[DatasetStatus::Uploaded, DatasetStatus::FeaturesReady]);
    let raw = session
        .latest_dataset(&filter)
        .await?
        .ok_or_else(|| ChurnError::NotFound {
            message: "No raw dataset found for labeling".to_string(),
        })?;
    let bytes = ctx.storage.blobs.get(&raw.blob.bucket, &raw.blob.path).await?;
    let table = parse_events(&bytes)?;

    let threshold = organization.churn_threshold_days;
    let reference = ctx.config.as_of().date_naive();
    let labels = label_customers(&table, threshold, reference);

    let mut unmatched = 0usize;
    let rows: Vec<LabeledRow> = vectors
        .into_iter()
        .map(|vector| {
            let churn_label = match labels.get(&vector.customer_id) {
                Some(churn_label) => *churn_label,
                None => {
                    unmatched += 1;
                    label(Some(vector.last_event_date), threshold, reference)
                }
            };
            LabeledRow {
                features: vector,
                churn_label,
            }
        })
        .collect();

    if unmatched > 0 {
        warn!(
            org_id = %organization.id,
            raw_dataset_id = %raw.id,
            unmatched,
            "feature rows absent from the labeling dataset were labeled from their own dates"
        );
    }
    Ok(rows)
}
