use chrono::{DateTime, Utc};

use crate::models::{ObservationSet, RiskPoint, RiskSeries};

/// A pure mapping from observations to time-to-flashover. Implementations
/// must be deterministic: equal input yields equal output.
pub trait RiskModel: Send + Sync {
    fn compute(&self, set: &ObservationSet) -> RiskSeries;
}

impl<F> RiskModel for F
where
    F: Fn(&ObservationSet) -> RiskSeries + Send + Sync,
{
    fn compute(&self, set: &ObservationSet) -> RiskSeries {
        self(set)
    }
}

/// Simplified fuel moisture model. Each observation pulls the fuel moisture
/// toward the equilibrium moisture content for its temperature and humidity,
/// at a rate set by the time lag; TTF in minutes grows with moisture and
/// shrinks with wind.
#[derive(Debug, Clone, Copy)]
pub struct MoistureModel {
    /// Fuel moisture (%) before the first observation.
    pub initial_moisture: f64,
    /// Hours for the fuel to close ~63% of the gap to equilibrium.
    pub time_lag_hours: f64,
}

impl Default for MoistureModel {
    fn default() -> Self {
        Self {
            initial_moisture: 15.0,
            time_lag_hours: 10.0,
        }
    }
}

impl RiskModel for MoistureModel {
    fn compute(&self, set: &ObservationSet) -> RiskSeries {
        let mut moisture = self.initial_moisture;
        let mut previous: Option<DateTime<Utc>> = None;
        let mut points = Vec::with_capacity(set.len());

        for point in &set.points {
            let elapsed_hours = match previous {
                Some(prev) => (point.timestamp - prev).num_seconds().max(0) as f64 / 3600.0,
                None => 1.0,
            };
            previous = Some(point.timestamp);

            let emc = equilibrium_moisture(point.temperature, point.humidity);
            let pull = 1.0 - (-elapsed_hours / self.time_lag_hours.max(0.1)).exp();
            moisture += (emc - moisture) * pull;

            points.push(RiskPoint {
                timestamp: point.timestamp,
                ttf: ttf_minutes(moisture, point.wind_speed),
            });
        }

        RiskSeries::new(points)
    }
}

/// Equilibrium moisture content (%) after Simard (1968).
pub fn equilibrium_moisture(temperature_c: f64, humidity: f64) -> f64 {
    let h = humidity.clamp(0.0, 100.0);
    let t = temperature_c * 9.0 / 5.0 + 32.0;

    let emc = if h < 10.0 {
        0.03229 + 0.281073 * h - 0.000578 * h * t
    } else if h < 50.0 {
        2.22749 + 0.160107 * h - 0.01478 * t
    } else {
        21.0606 + 0.005565 * h * h - 0.00035 * h * t - 0.483199 * h
    };

    emc.max(0.5)
}

pub fn ttf_minutes(moisture: f64, wind_speed: f64) -> f64 {
    let base = 0.6 * moisture.max(0.5).powf(1.7);
    base / (1.0 + 0.03 * wind_speed.max(0.0))
}
