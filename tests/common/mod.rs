#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::config::PersistenceConfig;
use billing_engine::models::BillingSnapshot;
use billing_engine::mqtt::SnapshotTransport;
use billing_engine::tariff::{TariffDefinition, TariffMeta};
use billing_engine::{
    AccumulatorSettings, AppError, BillingCalculator, EnergyAccumulator, EngineMetrics,
    IngestGateway, MemoryStore, PersistencePool, SnapshotPublisher,
};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const E6_STRUCTURE: &str = r#"{
    "fixed_charge_monthly": 10.0,
    "energy_charges": [
        {
            "limit_kwh": 400,
            "summer": {"peak": 0.45, "partial_peak": 0.30, "off_peak": 0.20},
            "winter": {"peak": 0.35, "partial_peak": 0.25, "off_peak": 0.18}
        },
        {
            "limit_kwh": null,
            "summer": {"peak": 0.55, "partial_peak": 0.40, "off_peak": 0.28},
            "winter": {"peak": 0.45, "partial_peak": 0.33, "off_peak": 0.24}
        }
    ],
    "tou_schedule": {
        "summer_months": [6, 7, 8, 9],
        "peak_hours": [16, 17, 18, 19, 20],
        "partial_peak_hours": [14, 15, 21, 22]
    }
}"#;

pub fn e6_tariff() -> TariffDefinition {
    let meta = TariffMeta {
        id: 6,
        name: "PG&E E-6".into(),
        utility: "PG&E".into(),
        co2_factor_kg_per_kwh: 0.42,
        effective_from: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        effective_to: None,
    };
    TariffDefinition::from_json(meta, E6_STRUCTURE).unwrap()
}

#[derive(Default)]
pub struct RecordingTransport {
    pub published: Mutex<Vec<BillingSnapshot>>,
}

impl RecordingTransport {
    pub fn published(&self) -> Vec<BillingSnapshot> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotTransport for RecordingTransport {
    async fn publish(&self, snapshot: &BillingSnapshot) -> Result<(), AppError> {
        self.published.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

/// The engine wired over an in-memory store, without broker or HTTP.
pub struct Engine {
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<EngineMetrics>,
    pub accumulator: Arc<EnergyAccumulator>,
    pub calculator: Arc<BillingCalculator>,
    pub gateway: IngestGateway,
    pub publisher: Arc<SnapshotPublisher>,
    pub transport: Arc<RecordingTransport>,
    pub pool: PersistencePool,
    pub shutdown: watch::Sender<bool>,
}

pub fn engine(homes: &[&str], utc_offset_hours: i32) -> Engine {
    let store = Arc::new(MemoryStore::new(Duration::from_secs(5)));
    let metrics = Arc::new(EngineMetrics::default());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let cfg = PersistenceConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        ..PersistenceConfig::default()
    };
    let pool = PersistencePool::start(store.clone(), &cfg, metrics.clone(), shutdown_rx);

    let homes: Vec<String> = homes.iter().map(|h| h.to_string()).collect();
    let accumulator = Arc::new(EnergyAccumulator::new(
        homes.clone(),
        ["base_load", "hvac", "ev_charger", "kitchen"],
        AccumulatorSettings::default(),
        pool.handle(),
    ));
    let calculator = Arc::new(BillingCalculator::new(
        accumulator.clone(),
        store.clone(),
        FixedOffset::east_opt(utc_offset_hours * 3600).unwrap(),
        metrics.clone(),
    ));
    let transport = Arc::new(RecordingTransport::default());
    let publisher = Arc::new(SnapshotPublisher::new(
        homes,
        calculator.clone(),
        accumulator.clone(),
        transport.clone(),
        pool.handle(),
        metrics.clone(),
    ));
    Engine {
        gateway: IngestGateway::new(accumulator.clone(), metrics.clone()),
        store,
        metrics,
        accumulator,
        calculator,
        publisher,
        transport,
        pool,
        shutdown,
    }
}

pub fn reading_payload(
    ts: DateTime<Utc>,
    category: &str,
    power_w: f64,
    energy_wh: Option<f64>,
) -> Vec<u8> {
    let mut body = serde_json::json!({
        "timestamp": ts.to_rfc3339(),
        "device_category": category,
        "power_w": power_w,
    });
    if let Some(wh) = energy_wh {
        body["energy_wh"] = serde_json::json!(wh);
    }
    serde_json::to_vec(&body).unwrap()
}

pub fn reading_topic(home_id: &str, category: &str) -> String {
    format!("home/{home_id}/device/{category}/power")
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
