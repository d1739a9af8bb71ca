use crate::db::DbPool;
use crate::error::AppError;
use crate::tariff::{TariffDefinition, TariffMeta};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
struct TariffRow {
    id: i64,
    name: String,
    utility: String,
    structure: String,
    co2_factor_kg_per_kwh: f64,
    effective_from: DateTime<Utc>,
    effective_to: Option<DateTime<Utc>>,
}

pub struct TariffRepository;

impl TariffRepository {
    /// Tariff of the home's plan whose effective range contains `at`.
    /// Rows are never edited in place; a change is a new effective-dated row.
    pub async fn active_for_home(
        pool: &DbPool,
        home_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<TariffDefinition>, AppError> {
        let row = sqlx::query_as::<_, TariffRow>(
            r#"
            SELECT
                t.id,
                t.name,
                t.utility,
                t.structure::text AS structure,
                t.co2_factor_kg_per_kwh,
                t.effective_from,
                t.effective_to
            FROM homes h
            JOIN tariffs t ON t.plan_code = h.tariff_plan_code
            WHERE h.id = $1
              AND t.effective_from <= $2
              AND (t.effective_to IS NULL OR t.effective_to > $2)
            ORDER BY t.effective_from DESC
            LIMIT 1
            "#,
        )
        .bind(home_id)
        .bind(at)
        .fetch_optional(pool)
        .await?;

        row.map(|r| {
            let meta = TariffMeta {
                id: r.id,
                name: r.name,
                utility: r.utility,
                co2_factor_kg_per_kwh: r.co2_factor_kg_per_kwh,
                effective_from: r.effective_from,
                effective_to: r.effective_to,
            };
            TariffDefinition::from_json(meta, &r.structure)
        })
        .transpose()
    }
}
