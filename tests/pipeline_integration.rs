//! End-to-end pipeline runs over the in-memory backend

mod common;

use anyhow::Result;
use churnwise::storage::{DatasetKind, DatasetStatus};
use churnwise::{Algorithm, RiskSegment, TrainingStatusReport};
use common::*;

#[tokio::test]
async fn test_ingest_features_train_predict() -> Result<()> {
    let (pipeline, _) = memory_pipeline(test_config());
    let org = pipeline.create_organization("Acme", Some(30)).await?;

    let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;
    assert_eq!(raw.status, DatasetStatus::Uploaded);
    assert_eq!(raw.row_count, 7);
    assert!(!raw.has_churn_label);

    let settled = pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;
    assert_eq!(settled.status, DatasetStatus::FeaturesReady);
    assert_eq!(
        pipeline.get_dataset(&org.id, &raw.id).await?.status,
        DatasetStatus::FeaturesReady
    );

    let ticket = pipeline
        .run_training_stage(&org.id, Algorithm::LogisticRegression)
        .await?;
    assert_eq!(ticket.status.as_str(), "training");
    let run = ticket.handle.wait().await?;
    assert_eq!(run.id, ticket.run_id);
    assert!(run.error_message().is_none(), "{:?}", run.error_message());

    let report = pipeline.get_training_status(&org.id).await?;
    let view = report.view();
    assert_eq!(view.status, "completed");
    // the zero-event customer never reaches the feature table
    assert_eq!(view.training_samples, Some(2));
    assert_eq!(view.churn_rate, Some(0.5));
    assert_eq!(view.model_type, Some(Algorithm::LogisticRegression));
    assert!(report.run().and_then(|run| run.model_path.clone()).is_some());

    let recent = pipeline.predict(&org.id, "recent", &recent_events()).await?;
    let stale = pipeline.predict(&org.id, "stale", &stale_events()).await?;
    assert_ne!(recent.risk_segment, RiskSegment::Critical);
    assert!(
        stale.churn_probability > recent.churn_probability + 0.2,
        "stale {} vs recent {}",
        stale.churn_probability,
        recent.churn_probability
    );
    Ok(())
}

#[tokio::test]
async fn test_every_algorithm_trains_and_scores() -> Result<()> {
    let (pipeline, _) = memory_pipeline(test_config());
    let org = pipeline.create_organization("Acme", None).await?;
    let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;
    pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;

    for algorithm in Algorithm::ALL {
        let run = pipeline
            .run_training_stage(&org.id, algorithm)
            .await?
            .handle
            .wait()
            .await?;
        assert!(run.metrics().is_some(), "{algorithm}: {:?}", run.error_message());
        assert_eq!(run.algorithm, algorithm);

        let scores = pipeline.score_latest_features(&org.id).await?;
        let customers: Vec<&str> = scores.iter().map(|p| p.customer_id.as_str()).collect();
        assert_eq!(customers, vec!["recent", "stale"]);
        assert!(scores
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.churn_probability)));
    }

    let history = pipeline.training_history(&org.id).await?;
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].trained_at >= w[1].trained_at));
    Ok(())
}

#[tokio::test]
async fn test_embedded_labels_override_threshold() -> Result<()> {
    let (pipeline, _) = memory_pipeline(test_config());
    let org = pipeline.create_organization("Acme", None).await?;

    // labels contradict inactivity: the active customer is marked churned
    let csv = format!(
        "customer_id,event_date,amount,churn_label\n\
         recent,{},80,1\n\
         recent,{},80,1\n\
         stale,{},25,0\n",
        days_ago(10),
        days_ago(2),
        days_ago(200)
    );
    let raw = pipeline.ingest(&org.id, csv.into_bytes()).await?;
    assert!(raw.has_churn_label);
    pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;

    let run = pipeline
        .run_training_stage(&org.id, Algorithm::LogisticRegression)
        .await?
        .handle
        .wait()
        .await?;
    assert_eq!(run.metrics().map(|m| m.total_samples), Some(2));

    let recent = pipeline.predict(&org.id, "recent", &recent_events()).await?;
    let stale = pipeline.predict(&org.id, "stale", &stale_events()).await?;
    assert!(recent.churn_probability > stale.churn_probability);
    Ok(())
}

#[tokio::test]
async fn test_threshold_change_relabels_next_run() -> Result<()> {
    let (pipeline, _) = memory_pipeline(test_config());
    let org = pipeline.create_organization("Acme", Some(30)).await?;
    let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;
    pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;

    // with a 365 day threshold nobody has churned, so the run cannot train
    pipeline.set_churn_threshold(&org.id, 365).await?;
    let run = pipeline
        .run_training_stage(&org.id, Algorithm::default())
        .await?
        .handle
        .wait()
        .await?;
    let message = run.error_message().unwrap_or_default().to_string();
    assert!(message.contains("both churned and active"), "{message}");

    match pipeline.get_training_status(&org.id).await? {
        TrainingStatusReport::Run(latest) => assert_eq!(latest.id, run.id),
        TrainingStatusReport::NotStarted => panic!("run was recorded"),
    }
    Ok(())
}

#[tokio::test]
async fn test_feature_stage_is_append_only() -> Result<()> {
    let (pipeline, _) = memory_pipeline(test_config());
    let org = pipeline.create_organization("Acme", None).await?;
    let raw = pipeline.ingest(&org.id, three_customer_csv()).await?;

    let first = pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;
    let second = pipeline
        .run_feature_stage(&org.id, &raw.id)
        .await?
        .wait()
        .await?;
    assert_eq!(first.status, DatasetStatus::FeaturesReady);
    assert_eq!(second.status, DatasetStatus::FeaturesReady);

    let features = pipeline
        .storage()
        .metadata
        .latest_dataset(
            &churnwise::storage::DatasetFilter::new(org.id).kind(DatasetKind::Features),
        )
        .await?
        .expect("features dataset");
    assert_eq!(features.source_dataset_id, Some(raw.id));
    assert_eq!(features.row_count, 2);
    assert_eq!(features.status, DatasetStatus::Ready);

    // a features dataset cannot feed the feature stage
    assert!(pipeline.run_feature_stage(&org.id, &features.id).await.is_err());
    Ok(())
}
