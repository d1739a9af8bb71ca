use crate::db::DbPool;
use crate::error::AppError;
use crate::models::BillingSnapshot;
use chrono::{DateTime, Utc};

pub struct SnapshotRepository;

impl SnapshotRepository {
    pub async fn insert(pool: &DbPool, snapshot: &BillingSnapshot) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO billing_snapshots (
                timestamp, home_id, cost_today, energy_today_kwh,
                projected_month, co2_today_kg, current_rate, tariff_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot.timestamp)
        .bind(&snapshot.home_id)
        .bind(snapshot.cost_today)
        .bind(snapshot.energy_today_kwh)
        .bind(snapshot.projected_month)
        .bind(snapshot.co2_today_kg)
        .bind(snapshot.current_rate)
        .bind(snapshot.tariff_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn history(
        pool: &DbPool,
        home_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingSnapshot>, AppError> {
        sqlx::query_as::<_, BillingSnapshot>(
            r#"
            SELECT
                timestamp,
                home_id,
                cost_today,
                energy_today_kwh,
                projected_month,
                co2_today_kg,
                current_rate,
                tariff_id
            FROM billing_snapshots
            WHERE home_id = $1
              AND timestamp >= $2
              AND timestamp < $3
            ORDER BY timestamp
            "#,
        )
        .bind(home_id)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)
    }
}
