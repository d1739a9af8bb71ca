use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single device power sample for a home.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub home_id: String,
    pub device_category: String,
    pub power_w: f64,
    /// Energy attributed to this sample, when the device reports it
    pub energy_wh: Option<f64>,
}

impl Reading {
    /// Energy in kWh carried by this reading.
    ///
    /// Uses `energy_wh` when present. Otherwise the power is assumed constant
    /// over one nominal sampling interval, which is only an approximation of
    /// the true consumption.
    pub fn energy_kwh(&self, sample_interval: Duration) -> f64 {
        match self.energy_wh {
            Some(wh) => wh / 1000.0,
            None => self.power_w * sample_interval.as_secs_f64() / 3600.0 / 1000.0,
        }
    }
}

/// Payload published on `home/{home_id}/device/{category}/power`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadingMessage {
    pub timestamp: DateTime<Utc>,
    pub device_category: String,
    pub power_w: f64,
    #[serde(default)]
    pub energy_wh: Option<f64>,
}

impl ReadingMessage {
    pub fn into_reading(self, home_id: impl Into<String>) -> Reading {
        Reading {
            timestamp: self.timestamp,
            home_id: home_id.into(),
            device_category: self.device_category,
            power_w: self.power_w,
            energy_wh: self.energy_wh,
        }
    }
}

/// Priced billing state of a home at one tick. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingSnapshot {
    pub timestamp: DateTime<Utc>,
    pub home_id: String,
    pub cost_today: f64,
    pub energy_today_kwh: f64,
    pub projected_month: f64,
    pub co2_today_kg: f64,
    pub current_rate: f64,
    pub tariff_id: i64,
}

/// Payload published on `home/{home_id}/billing/today_cost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingMessage {
    pub timestamp: DateTime<Utc>,
    pub cost_today: f64,
    pub energy_today_kwh: f64,
    pub projected_month: f64,
    pub co2_today_kg: f64,
    pub current_rate: f64,
}

impl From<&BillingSnapshot> for BillingMessage {
    fn from(s: &BillingSnapshot) -> Self {
        Self {
            timestamp: s.timestamp,
            cost_today: s.cost_today,
            energy_today_kwh: s.energy_today_kwh,
            projected_month: s.projected_month,
            co2_today_kg: s.co2_today_kg,
            current_rate: s.current_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_energy_prefers_reported_wh() {
        let reading = Reading {
            timestamp: Utc::now(),
            home_id: "home_001".into(),
            device_category: "hvac".into(),
            power_w: 1500.0,
            energy_wh: Some(12.5),
        };
        assert!((reading.energy_kwh(Duration::from_secs(5)) - 0.0125).abs() < 1e-12);
    }

    #[test]
    fn test_energy_integrates_power_over_sample_interval() {
        let reading = Reading {
            timestamp: Utc::now(),
            home_id: "home_001".into(),
            device_category: "hvac".into(),
            power_w: 3600.0,
            energy_wh: None,
        };
        // 3600 W for 5 s = 5 Wh
        assert!((reading.energy_kwh(Duration::from_secs(5)) - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_reading_message_parses_without_energy() {
        let msg: ReadingMessage = serde_json::from_str(
            r#"{"timestamp":"2024-07-01T17:00:00Z","device_category":"base_load","power_w":150.5}"#,
        )
        .unwrap();
        assert_eq!(msg.energy_wh, None);
        let reading = msg.into_reading("home_001");
        assert_eq!(reading.home_id, "home_001");
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 7, 1, 17, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_billing_message_fields() {
        let snapshot = BillingSnapshot {
            timestamp: Utc.with_ymd_and_hms(2024, 7, 1, 17, 0, 0).unwrap(),
            home_id: "home_001".into(),
            cost_today: 2.25,
            energy_today_kwh: 5.0,
            projected_month: 69.75,
            co2_today_kg: 2.1,
            current_rate: 0.45,
            tariff_id: 1,
        };
        let json = serde_json::to_value(BillingMessage::from(&snapshot)).unwrap();
        assert_eq!(json["cost_today"], 2.25);
        assert_eq!(json["current_rate"], 0.45);
        assert!(json.get("home_id").is_none());
        assert!(json.get("tariff_id").is_none());
    }
}
