//! The pipeline over the file backend survives a restart

mod common;

use anyhow::Result;
use churnwise::storage::{DatasetStatus, StorageConfig};
use churnwise::{Algorithm, Pipeline};
use common::*;
use tempfile::TempDir;

#[tokio::test]
async fn test_state_persists_across_pipeline_instances() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = test_config();
    config.storage = StorageConfig::file(temp_dir.path());

    let (org_id, raw_id, prediction) = {
        let pipeline = Pipeline::new(config.clone()).await?;
        let org = pipeline.create_organization("Acme", Some(30)).await?;
        let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;
        pipeline
            .run_feature_stage(&org.id, &raw.id)
            .await?
            .wait()
            .await?;
        let run = pipeline
            .run_training_stage(&org.id, Algorithm::GradientBoosting)
            .await?
            .handle
            .wait()
            .await?;
        assert!(run.metrics().is_some(), "{:?}", run.error_message());
        let prediction = pipeline.predict(&org.id, "stale", &stale_events()).await?;
        (org.id, raw.id, prediction)
    };

    let reopened = Pipeline::new(config).await?;
    assert_eq!(reopened.get_organization(&org_id).await?.churn_threshold_days, 30);
    assert_eq!(
        reopened.get_dataset(&org_id, &raw_id).await?.status,
        DatasetStatus::FeaturesReady
    );

    let view = reopened.get_training_status(&org_id).await?.view();
    assert_eq!(view.status, "completed");
    assert_eq!(view.model_type, Some(Algorithm::GradientBoosting));
    assert_eq!(view.training_samples, Some(2));

    // the artifact reloads from disk and scores identically
    let again = reopened.predict(&org_id, "stale", &stale_events()).await?;
    assert_eq!(again, prediction);
    assert!(reopened.health().await?.healthy);
    Ok(())
}

#[tokio::test]
async fn test_blobs_are_laid_out_per_organization() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = test_config();
    config.storage = StorageConfig::file(temp_dir.path());

    let pipeline = Pipeline::new(config).await?;
    let org = pipeline.create_organization("Acme", None).await?;
    let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;

    assert_eq!(raw.blob.bucket, churnwise::pipeline::DATASETS_BUCKET);
    assert!(raw.blob.path.starts_with(&format!("org_{}/raw/", org.id)));
    assert_eq!(raw.blob.size, three_customer_csv().len() as u64);
    assert!(pipeline
        .storage()
        .blobs
        .exists(&raw.blob.bucket, &raw.blob.path)
        .await?);
    Ok(())
}
