//! Artifact Store Adapter: one fitted model per organization over any blob store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::ChurnError;
use crate::model::ChurnModel;
use crate::storage::{BlobLocation, BlobStore, OrgId, StorageError};

pub const MODELS_BUCKET: &str = "models";
const ARTIFACT_NAME: &str = "churn_model.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactEnvelope {
    format_version: u32,
    organization_id: OrgId,
    saved_at: DateTime<Utc>,
    model: ChurnModel,
}

#[derive(Clone)]
pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn folder(org_id: &OrgId) -> String {
        format!("org_{org_id}")
    }

    /// Persist `model`, replacing whatever the organization had before
    pub async fn save(
        &self,
        org_id: &OrgId,
        model: &ChurnModel,
    ) -> Result<BlobLocation, ChurnError> {
        let envelope = ArtifactEnvelope {
            format_version: FORMAT_VERSION,
            organization_id: *org_id,
            saved_at: Utc::now(),
            model: model.clone(),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| ChurnError::internal(format!("failed to encode model: {e}")))?;

        let location = self
            .blobs
            .put(bytes, MODELS_BUCKET, &Self::folder(org_id), Some(ARTIFACT_NAME))
            .await?;
        debug!(%org_id, location = %location.location, "model artifact saved");
        Ok(location)
    }

    /// Load the organization's model; `ArtifactNotFound` before the first save
    pub async fn load(&self, org_id: &OrgId) -> Result<ChurnModel, ChurnError> {
        let path = format!("{}/{ARTIFACT_NAME}", Self::folder(org_id));
        let bytes = match self.blobs.get(MODELS_BUCKET, &path).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                return Err(ChurnError::ArtifactNotFound {
                    org_id: org_id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: ArtifactEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| ChurnError::internal(format!("corrupt model artifact: {e}")))?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(ChurnError::internal(format!(
                "unsupported model artifact version {}",
                envelope.format_version
            )));
        }
        if envelope.organization_id != *org_id {
            return Err(ChurnError::ArtifactNotFound {
                org_id: org_id.to_string(),
            });
        }
        envelope
            .model
            .check()
            .map_err(|e| ChurnError::internal(format!("corrupt model artifact: {e}")))?;
        Ok(envelope.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, LabeledRow, Trainer};
    use crate::storage::MemoryBackend;
    use chrono::{NaiveDate, TimeZone};

    use crate::features::CustomerFeatureVector;

    fn table() -> Vec<LabeledRow> {
        (0..12)
            .map(|i| {
                let churned = i % 2 == 0;
                LabeledRow {
                    features: CustomerFeatureVector {
                        customer_id: format!("c{i}"),
                        recency_score: (if churned { 3.0 } else { 90.0 }) + i as f64,
                        frequency_score: if churned { 10.0 } else { 60.0 },
                        monetary_score: 20.0,
                        engagement_score: if churned { 9.0 } else { 65.0 },
                        tenure_days: 100.0 + i as f64,
                        activity_trend: 0.0,
                        avg_transaction_value: 25.0,
                        days_between_transactions: if churned { 80.0 } else { 10.0 },
                        last_event_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                        calculated_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                        churn_label: None,
                    },
                    churn_label: u8::from(churned),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_load_before_save_is_artifact_not_found() {
        let store = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        let err = store.load(&OrgId::new()).await.unwrap_err();
        assert!(matches!(err, ChurnError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn test_save_then_load_returns_equal_model() {
        let store = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        let org = OrgId::new();
        let trainer = Trainer::default();

        for algorithm in Algorithm::ALL {
            let (model, _) = trainer.train(&table(), algorithm).unwrap();
            let location = store.save(&org, &model).await.unwrap();
            assert_eq!(location.bucket, MODELS_BUCKET);
            assert_eq!(location.path, format!("org_{org}/churn_model.json"));

            // latest save wins at the same key
            assert_eq!(store.load(&org).await.unwrap(), model);
        }
    }

    #[tokio::test]
    async fn test_artifacts_are_scoped_by_organization() {
        let store = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        let (model, _) = Trainer::default()
            .train(&table(), Algorithm::LogisticRegression)
            .unwrap();
        store.save(&OrgId::new(), &model).await.unwrap();

        assert!(store.load(&OrgId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_model_is_rejected_on_load() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ArtifactStore::new(backend.clone());
        let org = OrgId::new();
        let (model, _) = Trainer::default()
            .train(&table(), Algorithm::LogisticRegression)
            .unwrap();
        let location = store.save(&org, &model).await.unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_slice(&backend.get(MODELS_BUCKET, &location.path).await.unwrap())
                .unwrap();
        let scale = envelope["model"]["standardizer"]["scale"]
            .as_array_mut()
            .unwrap();
        scale.truncate(3);
        backend
            .put(
                serde_json::to_vec(&envelope).unwrap(),
                MODELS_BUCKET,
                &format!("org_{org}"),
                Some("churn_model.json"),
            )
            .await
            .unwrap();

        let err = store.load(&org).await.unwrap_err();
        assert!(matches!(err, ChurnError::InternalStage(_)), "{err}");
        assert!(err.to_string().contains("standardizer"), "{err}");
    }

    #[tokio::test]
    async fn test_unreachable_store_is_storage_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ArtifactStore::new(backend.clone());
        backend.set_offline(true);

        let err = store.load(&OrgId::new()).await.unwrap_err();
        assert!(matches!(err, ChurnError::StorageUnavailable(_)));
    }
}
