//! Pipeline Orchestrator
//!
//! The only component that knows stage ordering. Synchronous entry points
//! surface errors to the caller; background stages capture every failure,
//! panics included, into the record they own and never re-raise it.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::stages::{self, DATASETS_BUCKET};
use super::worker::{CancellationToken, StageExecutor, StageHandle};
use super::StageContext;
use crate::config::{validate_threshold, PipelineConfig};
use crate::error::ChurnError;
use crate::features::{parse_events, CustomerEvent};
use crate::model::{Algorithm, ChurnModel, Prediction};
use crate::storage::{
    DatasetId, DatasetKind, DatasetStatus, HealthStatus, MetadataSession, OrgId, Organization,
    RawDataset, StorageFactory, StorageHandles, TrainingRun, TrainingRunId, TrainingStatus,
};

/// Acknowledgement for a dispatched training run
#[derive(Debug)]
pub struct TrainingTicket {
    pub run_id: TrainingRunId,
    /// Always `training` at dispatch
    pub status: TrainingStatus,
    pub handle: StageHandle<TrainingRun>,
}

/// Latest training attempt for an organization
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingStatusReport {
    NotStarted,
    Run(TrainingRun),
}

impl TrainingStatusReport {
    pub fn status(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Run(run) => run.status.as_str(),
        }
    }

    pub fn run(&self) -> Option<&TrainingRun> {
        match self {
            Self::NotStarted => None,
            Self::Run(run) => Some(run),
        }
    }

    /// Flat rendering used by the CLI
    pub fn view(&self) -> TrainingStatusView {
        let Some(run) = self.run() else {
            return TrainingStatusView {
                status: self.status().to_string(),
                ..TrainingStatusView::default()
            };
        };
        let metrics = run.metrics();
        TrainingStatusView {
            status: self.status().to_string(),
            run_id: Some(run.id),
            model_type: Some(run.algorithm),
            accuracy: metrics.map(|m| m.accuracy),
            precision: metrics.map(|m| m.precision),
            recall: metrics.map(|m| m.recall),
            f1_score: metrics.map(|m| m.f1_score),
            roc_auc: metrics.map(|m| m.roc_auc),
            feature_importance: metrics.map(|m| m.feature_importance.clone()),
            training_samples: metrics.map(|m| m.total_samples),
            churn_rate: metrics.map(|m| m.churn_rate),
            trained_at: Some(run.trained_at),
            finished_at: run.finished_at,
            error_message: run.error_message().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingStatusView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<TrainingRunId>,
    pub model_type: Option<Algorithm>,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1_score: Option<f64>,
    pub roc_auc: Option<f64>,
    pub feature_importance: Option<BTreeMap<String, f64>>,
    pub training_samples: Option<usize>,
    pub churn_rate: Option<f64>,
    pub trained_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Entry point for every pipeline operation. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<StageContext>,
    executor: StageExecutor,
}

impl Pipeline {
    /// Build storage from `config.storage` and start the worker pool
    pub async fn new(config: PipelineConfig) -> Result<Self, ChurnError> {
        config.validate()?;
        let storage = StorageFactory::from_config(&config.storage).await?;
        Self::with_storage(config, storage)
    }

    /// Run over storage the caller already built
    pub fn with_storage(config: PipelineConfig, storage: StorageHandles) -> Result<Self, ChurnError> {
        config.validate()?;
        let executor = StageExecutor::new(config.workers);
        Ok(Self {
            ctx: Arc::new(StageContext::new(config, storage)),
            executor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    pub fn storage(&self) -> &StorageHandles {
        &self.ctx.storage
    }

    pub async fn health(&self) -> Result<HealthStatus, ChurnError> {
        Ok(self.ctx.storage.metadata.health_check().await?)
    }

    async fn session(&self) -> Result<MetadataSession, ChurnError> {
        Ok(self.ctx.sessions.acquire().await?)
    }

    async fn organization(
        &self,
        session: &MetadataSession,
        org_id: &OrgId,
    ) -> Result<Organization, ChurnError> {
        session
            .load_organization(org_id)
            .await?
            .ok_or_else(|| ChurnError::not_found(format!("Organization {org_id}")))
    }

    async fn dataset(
        &self,
        session: &MetadataSession,
        org_id: &OrgId,
        dataset_id: &DatasetId,
    ) -> Result<RawDataset, ChurnError> {
        session
            .load_dataset(dataset_id)
            .await?
            .filter(|dataset| dataset.organization_id == *org_id)
            .ok_or_else(|| ChurnError::not_found(format!("Dataset {dataset_id}")))
    }

    pub async fn create_organization(
        &self,
        name: &str,
        churn_threshold_days: Option<u32>,
    ) -> Result<Organization, ChurnError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChurnError::validation("organization name must not be empty"));
        }
        let threshold =
            churn_threshold_days.unwrap_or(self.ctx.config.default_churn_threshold_days);
        validate_threshold(threshold)?;

        let organization = Organization {
            id: OrgId::new(),
            name: name.to_string(),
            churn_threshold_days: threshold,
            created_at: Utc::now(),
        };
        self.session()
            .await?
            .save_organization(&organization)
            .await?;
        info!(org_id = %organization.id, threshold, "organization created");
        Ok(organization)
    }

    pub async fn get_organization(&self, org_id: &OrgId) -> Result<Organization, ChurnError> {
        let session = self.session().await?;
        self.organization(&session, org_id).await
    }

    /// Change the inactivity threshold used by future training runs
    pub async fn set_churn_threshold(
        &self,
        org_id: &OrgId,
        days: u32,
    ) -> Result<Organization, ChurnError> {
        validate_threshold(days)?;
        let session = self.session().await?;
        let mut organization = self.organization(&session, org_id).await?;
        organization.churn_threshold_days = days;
        session.save_organization(&organization).await?;
        Ok(organization)
    }

    /// Store an uploaded events table and register it as `uploaded`
    pub async fn ingest(&self, org_id: &OrgId, raw_bytes: Vec<u8>) -> Result<RawDataset, ChurnError> {
        let session = self.session().await?;
        self.organization(&session, org_id).await?;
        let table = parse_events(&raw_bytes)?;

        let id = DatasetId::new();
        let name = format!("raw_{id}.csv");
        let blob = self
            .ctx
            .storage
            .blobs
            .put(raw_bytes, DATASETS_BUCKET, &stages::raw_folder(org_id), Some(&name))
            .await?;

        let dataset = RawDataset {
            id,
            organization_id: *org_id,
            kind: DatasetKind::Raw,
            blob,
            row_count: table.row_count,
            has_churn_label: table.has_churn_label,
            status: DatasetStatus::Uploaded,
            source_dataset_id: None,
            error_message: None,
            created_at: Utc::now(),
        };
        session.save_dataset(&dataset).await?;
        info!(
            %org_id,
            dataset_id = %dataset.id,
            rows = dataset.row_count,
            has_churn_label = dataset.has_churn_label,
            "raw dataset ingested"
        );
        Ok(dataset)
    }

    pub async fn get_dataset(
        &self,
        org_id: &OrgId,
        dataset_id: &DatasetId,
    ) -> Result<RawDataset, ChurnError> {
        let session = self.session().await?;
        self.organization(&session, org_id).await?;
        self.dataset(&session, org_id, dataset_id).await
    }

    /// Queue feature derivation for a raw dataset.
    ///
    /// Only dispatch checks fail here; the outcome is recorded on the dataset.
    pub async fn run_feature_stage(
        &self,
        org_id: &OrgId,
        dataset_id: &DatasetId,
    ) -> Result<StageHandle<RawDataset>, ChurnError> {
        let dataset = {
            let session = self.session().await?;
            self.organization(&session, org_id).await?;
            self.dataset(&session, org_id, dataset_id).await?
        };
        if dataset.kind != DatasetKind::Raw {
            return Err(ChurnError::validation(format!(
                "dataset {dataset_id} holds features; derive features from a raw dataset"
            )));
        }

        debug!(%org_id, %dataset_id, "feature stage queued");
        let pipeline = self.clone();
        Ok(self.executor.submit("features", move |token| async move {
            pipeline.execute_feature_stage(dataset, token).await
        }))
    }

    async fn execute_feature_stage(self, snapshot: RawDataset, token: CancellationToken) -> RawDataset {
        let attempt = AssertUnwindSafe(self.feature_stage(&snapshot, &token))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ChurnError::internal(panic_message(payload))));

        match attempt {
            Ok(dataset) => dataset,
            Err(e) => {
                error!(
                    org_id = %snapshot.organization_id,
                    dataset_id = %snapshot.id,
                    code = e.code(),
                    error = %e,
                    "feature stage failed"
                );
                self.record_feature_failure(snapshot, &e).await
            }
        }
    }

    async fn feature_stage(
        &self,
        snapshot: &RawDataset,
        token: &CancellationToken,
    ) -> Result<RawDataset, ChurnError> {
        if token.is_cancelled() {
            return Err(ChurnError::internal("feature stage cancelled before start"));
        }
        let session = self.session().await?;
        let mut raw = self
            .dataset(&session, &snapshot.organization_id, &snapshot.id)
            .await?;

        raw.transition(DatasetStatus::Processing)?;
        session.save_dataset(&raw).await?;
        info!(org_id = %raw.organization_id, dataset_id = %raw.id, "feature stage started");

        let features = stages::derive_features(&self.ctx, &session, &raw).await?;

        raw.transition(DatasetStatus::FeaturesReady)?;
        session.save_dataset(&raw).await?;
        info!(
            org_id = %raw.organization_id,
            dataset_id = %raw.id,
            features_dataset_id = %features.id,
            "feature stage finished"
        );
        Ok(raw)
    }

    async fn record_feature_failure(&self, snapshot: RawDataset, failure: &ChurnError) -> RawDataset {
        let mut dataset = snapshot;
        let session = match self.session().await {
            Ok(session) => Some(session),
            Err(e) => {
                error!(dataset_id = %dataset.id, error = %e, "cannot open a session to record the failure");
                None
            }
        };
        if let Some(session) = &session {
            match session.load_dataset(&dataset.id).await {
                Ok(Some(stored)) => dataset = stored,
                Ok(None) => {}
                Err(e) => warn!(dataset_id = %dataset.id, error = %e, "reporting the dispatched dataset record"),
            }
        }

        // the record belongs to another invocation that is still processing it
        if matches!(failure, ChurnError::InvalidTransition { .. }) {
            return dataset;
        }
        if let Err(e) = dataset.mark_error(failure.to_string()) {
            warn!(dataset_id = %dataset.id, status = %dataset.status, error = %e, "dataset left as is");
            return dataset;
        }
        if let Some(session) = &session {
            if let Err(e) = session.save_dataset(&dataset).await {
                error!(dataset_id = %dataset.id, error = %e, "failed to persist dataset error");
            }
        }
        dataset
    }

    /// Create a `training` run and queue it.
    ///
    /// The run is pollable as soon as this returns. Runs for the same
    /// organization execute one at a time.
    pub async fn run_training_stage(
        &self,
        org_id: &OrgId,
        algorithm: Algorithm,
    ) -> Result<TrainingTicket, ChurnError> {
        let (organization, run) = {
            let session = self.session().await?;
            let organization = self.organization(&session, org_id).await?;
            let run = TrainingRun::new(organization.id, algorithm);
            session.save_training_run(&run).await?;
            (organization, run)
        };
        info!(%org_id, run_id = %run.id, %algorithm, "training run queued");

        let run_id = run.id;
        let status = run.status.clone();
        let pipeline = self.clone();
        let handle = self.executor.submit("training", move |token| async move {
            pipeline.execute_training_stage(organization, run, token).await
        });
        Ok(TrainingTicket {
            run_id,
            status,
            handle,
        })
    }

    async fn execute_training_stage(
        self,
        organization: Organization,
        queued: TrainingRun,
        token: CancellationToken,
    ) -> TrainingRun {
        let attempt = AssertUnwindSafe(self.training_stage(&organization, &queued, &token))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ChurnError::internal(panic_message(payload))));

        match attempt {
            Ok(run) => run,
            Err(e) => {
                error!(
                    org_id = %organization.id,
                    run_id = %queued.id,
                    code = e.code(),
                    error = %e,
                    "training stage failed"
                );
                self.record_training_failure(queued, &e).await
            }
        }
    }

    async fn training_stage(
        &self,
        organization: &Organization,
        queued: &TrainingRun,
        token: &CancellationToken,
    ) -> Result<TrainingRun, ChurnError> {
        if token.is_cancelled() {
            return Err(ChurnError::internal("training stage cancelled before start"));
        }

        // completion must land while the lease is held so the newest
        // completed run always matches the stored artifact
        let lease = self
            .ctx
            .single_flight
            .acquire(&organization.id, &queued.id.to_string())
            .await?;
        let session = self.session().await?;

        let mut run = session
            .load_training_run(&queued.id)
            .await?
            .unwrap_or_else(|| queued.clone());
        run.started_at = Some(Utc::now());
        session.save_training_run(&run).await?;
        info!(
            org_id = %organization.id,
            run_id = %run.id,
            algorithm = %run.algorithm,
            "training started"
        );

        let outcome = stages::train_model(&self.ctx, &session, organization, run.algorithm).await?;
        let accuracy = outcome.metrics.accuracy;
        let samples = outcome.metrics.total_samples;
        run.complete(outcome.model_path, outcome.metrics)?;
        session.save_training_run(&run).await?;
        lease.release().await;

        info!(
            org_id = %organization.id,
            run_id = %run.id,
            accuracy,
            samples,
            "training completed"
        );
        Ok(run)
    }

    async fn record_training_failure(&self, queued: TrainingRun, failure: &ChurnError) -> TrainingRun {
        let mut run = queued;
        let session = match self.session().await {
            Ok(session) => Some(session),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "cannot open a session to record the failure");
                None
            }
        };
        if let Some(session) = &session {
            match session.load_training_run(&run.id).await {
                Ok(Some(stored)) => run = stored,
                Ok(None) => {}
                Err(e) => warn!(run_id = %run.id, error = %e, "reporting the queued run record"),
            }
        }

        if let Err(e) = run.fail(failure.to_string()) {
            warn!(run_id = %run.id, error = %e, "training run already settled");
            return run;
        }
        if let Some(session) = &session {
            if let Err(e) = session.save_training_run(&run).await {
                error!(run_id = %run.id, error = %e, "failed to persist training failure");
            }
        }
        run
    }

    /// Most recent training attempt, or `NotStarted`
    pub async fn get_training_status(&self, org_id: &OrgId) -> Result<TrainingStatusReport, ChurnError> {
        let session = self.session().await?;
        self.organization(&session, org_id).await?;
        let latest = session.list_training_runs(org_id).await?.into_iter().next();
        Ok(latest.map_or(TrainingStatusReport::NotStarted, TrainingStatusReport::Run))
    }

    /// Every training attempt, newest first
    pub async fn training_history(&self, org_id: &OrgId) -> Result<Vec<TrainingRun>, ChurnError> {
        let session = self.session().await?;
        self.organization(&session, org_id).await?;
        Ok(session.list_training_runs(org_id).await?)
    }

    /// The organization's model, provided a training run has completed
    async fn trained_model(&self, org_id: &OrgId) -> Result<ChurnModel, ChurnError> {
        {
            let session = self.session().await?;
            self.organization(&session, org_id).await?;
            let trained = session
                .list_training_runs(org_id)
                .await?
                .iter()
                .any(|run| matches!(run.status, TrainingStatus::Completed { .. }));
            if !trained {
                return Err(ChurnError::ArtifactNotFound {
                    org_id: org_id.to_string(),
                });
            }
        }
        self.ctx.artifacts.load(org_id).await
    }

    /// Score one customer from their event history
    pub async fn predict(
        &self,
        org_id: &OrgId,
        customer_id: &str,
        events: &[CustomerEvent],
    ) -> Result<Prediction, ChurnError> {
        let customer_id = customer_id.trim();
        if customer_id.is_empty() {
            return Err(ChurnError::validation("customer_id must not be empty"));
        }
        if events.is_empty() {
            return Err(ChurnError::validation("events must not be empty"));
        }

        let model = self.trained_model(org_id).await?;
        let features = self
            .ctx
            .deriver
            .derive_for(customer_id, events, self.ctx.config.as_of())
            .ok_or_else(|| ChurnError::validation("events must not be empty"))?;

        let prediction = model.predict(&features);
        debug!(
            %org_id,
            customer_id,
            probability = prediction.churn_probability,
            segment = %prediction.risk_segment,
            "prediction served"
        );
        Ok(prediction)
    }

    /// Score every customer in the latest ready features dataset
    pub async fn score_latest_features(&self, org_id: &OrgId) -> Result<Vec<Prediction>, ChurnError> {
        let model = self.trained_model(org_id).await?;
        let session = self.session().await?;
        let organization = self.organization(&session, org_id).await?;
        let (dataset, vectors) = stages::latest_features(&self.ctx, &session, &organization).await?;

        let predictions: Vec<Prediction> = vectors.iter().map(|vector| model.predict(vector)).collect();
        info!(
            %org_id,
            features_dataset_id = %dataset.id,
            customers = predictions.len(),
            "batch scored"
        );
        Ok(predictions)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("stage panicked: {detail}"),
        None => "stage panicked".to_string(),
    }
}
