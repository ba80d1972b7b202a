use std::fmt::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::models::{ContentKey, Location, ObservationSet, RawObservation, RiskSeries};
use crate::notify::DangerTier;

/// Reads observations from a CSV with columns `timestamp, temperature,
/// humidity, wind_speed`. Rows with a missing measurement are dropped and
/// counted.
pub fn import_observations_csv(csv_path: &Path) -> Result<(ObservationSet, usize)> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut raw = Vec::new();

    for result in reader.deserialize::<RawObservation>() {
        raw.push(result?);
    }

    let (set, rejected) = ObservationSet::from_raw(raw);
    Ok((set, rejected.len()))
}

pub fn write_observations_csv(path: &Path, set: &ObservationSet) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for point in &set.points {
        writer.serialize(point)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_risk_csv(path: &Path, series: &RiskSeries) -> Result<()> {
    #[derive(Serialize)]
    struct RiskRow<'a> {
        timestamp: String,
        ttf: f64,
        danger_level: &'a str,
    }

    let mut writer = csv::Writer::from_path(path)?;
    for point in &series.points {
        writer.serialize(RiskRow {
            timestamp: point.timestamp.to_rfc3339(),
            ttf: point.ttf,
            danger_level: DangerTier::classify(point.ttf).as_str(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `<slug>_weather.csv` and `<slug>_firerisk.csv` into `dir`.
pub fn write_location_outputs(
    dir: &Path,
    location: &Location,
    set: &ObservationSet,
    series: &RiskSeries,
) -> Result<(PathBuf, PathBuf)> {
    let slug = location.slug();
    let weather = dir.join(format!("{slug}_weather.csv"));
    let risk = dir.join(format!("{slug}_firerisk.csv"));

    write_observations_csv(&weather, set)?;
    write_risk_csv(&risk, series)?;
    Ok((weather, risk))
}

pub fn build_summary(key: &ContentKey, set: &ObservationSet, series: Option<&RiskSeries>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cached Observation Set");
    let _ = writeln!(output, "Key {key}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Observations");

    match (set.first(), set.last()) {
        (Some(first), Some(last)) => {
            let _ = writeln!(
                output,
                "{} points from {} to {}",
                set.len(),
                first.timestamp.to_rfc3339(),
                last.timestamp.to_rfc3339()
            );
            let _ = writeln!(
                output,
                "- latest: {:.1}°C, {:.1}% humidity, {:.1} m/s wind",
                last.temperature, last.humidity, last.wind_speed
            );
        }
        _ => {
            let _ = writeln!(output, "No observations stored.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Fire Risk");

    match series.and_then(|s| s.latest().map(|latest| (s, latest))) {
        Some((series, latest)) => {
            let min = series
                .points
                .iter()
                .map(|p| p.ttf)
                .fold(f64::INFINITY, f64::min);
            let tier = DangerTier::classify(latest.ttf);
            let _ = writeln!(
                output,
                "- latest ttf {:.2} min at {} ({})",
                latest.ttf,
                latest.timestamp.to_rfc3339(),
                tier
            );
            let _ = writeln!(
                output,
                "- lowest ttf {:.2} min ({})",
                min,
                DangerTier::classify(min)
            );
        }
        None => {
            let _ = writeln!(output, "No risk series computed yet.");
        }
    }

    output
}
