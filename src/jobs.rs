use crate::entities;
use crate::errors::ApsisError;
use crate::rotation::RotationEngine;
use crate::settings;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    engine: RotationEngine,
    cfg: &settings::Rotation,
) -> Result<JobScheduler, ApsisError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| ApsisError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let engine_clone = engine.clone();

    // Rotation tick: reaper, periodic fleet trigger, coordinator
    let tick_job = Job::new_async(cfg.tick_schedule.as_str(), move |_uuid, _l| {
        let engine = engine_clone.clone();
        Box::pin(async move {
            let execution_id = start_job_execution(engine.db(), "rotation_tick").await.ok();

            match engine.tick().await {
                Ok(count) => {
                    if count > 0 {
                        info!("Rotation tick processed {} state changes", count);
                    }
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(
                            engine.db(),
                            id,
                            true,
                            None,
                            Some(count as i64),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    error!("Rotation tick failed: {}", e);
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(
                            engine.db(),
                            id,
                            false,
                            Some(e.to_string()),
                            None,
                        )
                        .await;
                    }
                }
            }
        })
    })
    .map_err(|e| ApsisError::Other(format!("Failed to create rotation tick job: {}", e)))?;

    sched
        .add(tick_job)
        .await
        .map_err(|e| ApsisError::Other(format!("Failed to add rotation tick job: {}", e)))?;

    let engine_clone = engine.clone();

    // Partial-failure reconciliation sweep, kept off the tick's hot path
    let reconcile_job = Job::new_async(cfg.reconcile_schedule.as_str(), move |_uuid, _l| {
        let engine = engine_clone.clone();
        Box::pin(async move {
            let execution_id = start_job_execution(engine.db(), "reconcile").await.ok();

            match engine.reconcile_partial_rotations().await {
                Ok(count) => {
                    if count > 0 {
                        info!("Reconciliation repaired {} devices", count);
                    }
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(
                            engine.db(),
                            id,
                            true,
                            None,
                            Some(count as i64),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    error!("Reconciliation sweep failed: {}", e);
                    if let Some(id) = execution_id {
                        let _ = complete_job_execution(
                            engine.db(),
                            id,
                            false,
                            Some(e.to_string()),
                            None,
                        )
                        .await;
                    }
                }
            }
        })
    })
    .map_err(|e| ApsisError::Other(format!("Failed to create reconcile job: {}", e)))?;

    sched
        .add(reconcile_job)
        .await
        .map_err(|e| ApsisError::Other(format!("Failed to add reconcile job: {}", e)))?;

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| ApsisError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", 2);

    Ok(sched)
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, ApsisError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        id: Set(0), // Will be auto-generated
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), ApsisError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (useful for admin API)
pub async fn trigger_job_manually(
    engine: &RotationEngine,
    job_name: &str,
) -> Result<(), ApsisError> {
    info!("Manually triggering job: {}", job_name);
    let execution_id = start_job_execution(engine.db(), job_name).await?;

    let result = match job_name {
        "rotation_tick" => engine.tick().await,
        "reconcile" => engine.reconcile_partial_rotations().await,
        _ => {
            return Err(ApsisError::BadRequest(format!(
                "Unknown job name: {}",
                job_name
            )));
        }
    };

    match result {
        Ok(count) => {
            info!(
                "Manually triggered job {} completed: {} records",
                job_name, count
            );
            complete_job_execution(engine.db(), execution_id, true, None, Some(count as i64))
                .await?;
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(engine.db(), execution_id, false, Some(e.to_string()), None)
                .await?;
        }
    }

    Ok(())
}
