use super::types::{HistorySample, SampleReason};
use crate::telemetry::{Measurements, TelemetryRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS site_latest (
            site_id text primary key,
            temperature double precision null,
            air_humidity double precision null,
            soil_humidity double precision null,
            light double precision null,
            co2 double precision null,
            ts timestamptz not null,
            updated_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS site_history (
            id bigserial primary key,
            site_id text not null,
            temperature double precision null,
            air_humidity double precision null,
            soil_humidity double precision null,
            light double precision null,
            co2 double precision null,
            ts timestamptz not null,
            sampled_at timestamptz not null,
            reason text not null
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS site_history_site_sampled_idx ON site_history (site_id, sampled_at DESC)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn measurements_from_row(row: &PgRow) -> Result<Measurements> {
    Ok(Measurements {
        temperature: row.try_get::<Option<f64>, _>("temperature")?,
        air_humidity: row.try_get::<Option<f64>, _>("air_humidity")?,
        soil_humidity: row.try_get::<Option<f64>, _>("soil_humidity")?,
        light: row.try_get::<Option<f64>, _>("light")?,
        co2: row.try_get::<Option<f64>, _>("co2")?,
    })
}

pub async fn load_latest(pool: &PgPool) -> Result<Vec<TelemetryRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT site_id, temperature, air_humidity, soil_humidity, light, co2, ts
        FROM site_latest
        ORDER BY site_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(TelemetryRecord {
            site_id: row.try_get::<String, _>("site_id")?,
            measurements: measurements_from_row(&row)?,
            timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
        });
    }
    Ok(out)
}

/// Up to `per_site` most recent samples per site, oldest first within a site.
pub async fn load_recent_history(pool: &PgPool, per_site: usize) -> Result<Vec<HistorySample>> {
    let rows = sqlx::query(
        r#"
        SELECT site_id, temperature, air_humidity, soil_humidity, light, co2, ts, sampled_at, reason
        FROM (
            SELECT *,
                   row_number() OVER (PARTITION BY site_id ORDER BY sampled_at DESC, id DESC) AS rn
            FROM site_history
        ) ranked
        WHERE rn <= $1
        ORDER BY site_id, sampled_at ASC, id ASC
        "#,
    )
    .bind(i64::try_from(per_site).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_reason = row.try_get::<String, _>("reason")?;
        let Some(reason) = SampleReason::parse(&raw_reason) else {
            tracing::warn!(reason = %raw_reason, "skipping history row with unknown reason");
            continue;
        };
        out.push(HistorySample {
            record: TelemetryRecord {
                site_id: row.try_get::<String, _>("site_id")?,
                measurements: measurements_from_row(&row)?,
                timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
            },
            sampled_at: row.try_get::<DateTime<Utc>, _>("sampled_at")?,
            reason,
        });
    }
    Ok(out)
}

pub(crate) async fn clear_all(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM site_history")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM site_latest")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
