//! Capacity estimate cache
//!
//! Footprints are measured once per distinct model set and stored under a
//! SHA-256 fingerprint of the sorted model list, so re-ordering the list in
//! config does not trigger a re-measurement.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::info;
use wktag_common::Result;

use crate::config::CapacitySection;
use crate::error::{TaggerError, TaggerResult};
use crate::tier::CapacityEstimate;
use crate::worker::Processor;

/// Order-insensitive fingerprint of a model list
pub fn model_set_fingerprint(models: &[String]) -> String {
    let mut sorted: Vec<&str> = models.iter().map(|m| m.trim()).filter(|m| !m.is_empty()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for model in sorted {
        hasher.update(model.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub async fn load_estimate(pool: &SqlitePool, fingerprint: &str) -> Result<Option<CapacityEstimate>> {
    let row = sqlx::query(
        "SELECT backbone_vram_mb, per_worker_ram_mb FROM capacity_estimates WHERE fingerprint = ?",
    )
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| CapacityEstimate {
        backbone_vram_mb: u64::try_from(row.get::<i64, _>("backbone_vram_mb")).unwrap_or(0),
        per_worker_ram_mb: u64::try_from(row.get::<i64, _>("per_worker_ram_mb")).unwrap_or(0),
    }))
}

pub async fn store_estimate(
    pool: &SqlitePool,
    fingerprint: &str,
    models: &[String],
    estimate: &CapacityEstimate,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO capacity_estimates (fingerprint, models, backbone_vram_mb, per_worker_ram_mb, measured_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(fingerprint) DO UPDATE SET
            models = excluded.models,
            backbone_vram_mb = excluded.backbone_vram_mb,
            per_worker_ram_mb = excluded.per_worker_ram_mb,
            measured_at = excluded.measured_at
        "#,
    )
    .bind(fingerprint)
    .bind(models.join(","))
    .bind(i64::try_from(estimate.backbone_vram_mb).unwrap_or(i64::MAX))
    .bind(i64::try_from(estimate.per_worker_ram_mb).unwrap_or(i64::MAX))
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Pinned config values, else cached measurement, else measure and cache
pub async fn resolve_estimate(
    pool: &SqlitePool,
    section: &CapacitySection,
    processor: &dyn Processor,
) -> TaggerResult<CapacityEstimate> {
    if let Some(estimate) = section.pinned_estimate() {
        info!(
            backbone_vram_mb = estimate.backbone_vram_mb,
            per_worker_ram_mb = estimate.per_worker_ram_mb,
            "Using capacity estimate from config"
        );
        return Ok(estimate);
    }

    let fingerprint = model_set_fingerprint(&section.models);
    if let Some(estimate) = load_estimate(pool, &fingerprint).await? {
        info!(fingerprint = %fingerprint, "Using cached capacity estimate");
        return Ok(estimate);
    }

    info!(fingerprint = %fingerprint, models = section.models.len(), "Measuring capacity estimate");
    let estimate = processor
        .measure()
        .await
        .map_err(|e| TaggerError::Config(format!("no capacity estimate available: {}", e)))?;
    store_estimate(pool, &fingerprint, &section.models, &estimate).await?;
    info!(
        backbone_vram_mb = estimate.backbone_vram_mb,
        per_worker_ram_mb = estimate.per_worker_ram_mb,
        "Capacity estimate measured and cached"
    );
    Ok(estimate)
}
