use std::sync::Arc;

use serde::{Deserialize, Serialize};
use surveil_common::config::LocationConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;

/// A coordinate update, serialized the way the location endpoint expects it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
}

impl Fix {
    pub fn new(lat: f64, lon: f64) -> Result<Self, LocationError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(LocationError::OutOfRange("latitude", lat));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(LocationError::OutOfRange("longitude", lon));
        }
        Ok(Self { lat, lon })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("unknown location source {0:?}, expected none, static or stdin")]
    UnknownSource(String),
    #[error("static location requires lat and lon")]
    MissingCoordinates,
    #[error("{0} {1} out of range")]
    OutOfRange(&'static str, f64),
    #[error("unparseable location line {0:?}")]
    Parse(String),
    #[error("failed to read location input: {0}")]
    Read(#[from] std::io::Error),
}

/// Where coordinate updates come from.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSource {
    None,
    Static(Fix),
    Stdin,
}

impl LocationSource {
    pub fn from_config(config: &LocationConfig) -> Result<Self, LocationError> {
        match config.source.as_str() {
            "none" => Ok(LocationSource::None),
            "static" => match (config.lat, config.lon) {
                (Some(lat), Some(lon)) => Ok(LocationSource::Static(Fix::new(lat, lon)?)),
                _ => Err(LocationError::MissingCoordinates),
            },
            "stdin" => Ok(LocationSource::Stdin),
            other => Err(LocationError::UnknownSource(other.to_string())),
        }
    }
}

/// Parse `{"lat":..,"lon":..}` or `lat,lon`.
pub fn parse_fix(line: &str) -> Result<Fix, LocationError> {
    let line = line.trim();
    if line.starts_with('{') {
        let fix: Fix =
            serde_json::from_str(line).map_err(|_| LocationError::Parse(line.to_string()))?;
        return Fix::new(fix.lat, fix.lon);
    }
    let (lat, lon) = line
        .split_once(',')
        .ok_or_else(|| LocationError::Parse(line.to_string()))?;
    let lat = lat
        .trim()
        .parse::<f64>()
        .map_err(|_| LocationError::Parse(line.to_string()))?;
    let lon = lon
        .trim()
        .parse::<f64>()
        .map_err(|_| LocationError::Parse(line.to_string()))?;
    Fix::new(lat, lon)
}

/// Read one fix per line from `reader` and push it to `tx`.
/// Blank and malformed lines are skipped.
pub async fn read_fixes<R>(reader: R, tx: mpsc::Sender<Fix>) -> Result<(), LocationError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_fix(&line) {
            Ok(fix) => {
                if tx.send(fix).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "skipping location update"),
        }
    }
    Ok(())
}

/// Forward coordinate updates from `source` to the location endpoint.
pub async fn run_location_updates(source: LocationSource, api: Arc<ApiClient>) {
    let (tx, mut rx) = mpsc::channel(16);
    match source {
        LocationSource::None => return,
        LocationSource::Static(fix) => {
            let _ = tx.send(fix).await;
            drop(tx);
        }
        LocationSource::Stdin => {
            tokio::spawn(async move {
                match read_fixes(BufReader::new(tokio::io::stdin()), tx).await {
                    Ok(()) => info!("location input closed"),
                    Err(e) => warn!(error = %e, "location input failed"),
                }
            });
        }
    }

    while let Some(fix) = rx.recv().await {
        match api.report_location(fix).await {
            Ok(()) => debug!(lat = fix.lat, lon = fix.lon, "location reported"),
            Err(e) => debug!(error = %e, "location report failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_and_csv() {
        assert_eq!(
            parse_fix(r#"{"lat": 48.5, "lon": -122.25}"#).unwrap(),
            Fix { lat: 48.5, lon: -122.25 }
        );
        assert_eq!(parse_fix(" 48.5 , -122.25 ").unwrap(), Fix { lat: 48.5, lon: -122.25 });
    }

    #[test]
    fn rejects_garbage_and_out_of_range() {
        assert!(matches!(parse_fix("hello"), Err(LocationError::Parse(_))));
        assert!(matches!(parse_fix("1.0,abc"), Err(LocationError::Parse(_))));
        assert!(matches!(
            parse_fix("91.0,0.0"),
            Err(LocationError::OutOfRange("latitude", _))
        ));
        assert!(matches!(
            parse_fix(r#"{"lat": 0.0, "lon": 200.0}"#),
            Err(LocationError::OutOfRange("longitude", _))
        ));
    }

    #[test]
    fn source_from_config() {
        let mut config = LocationConfig::default();
        assert_eq!(LocationSource::from_config(&config).unwrap(), LocationSource::None);

        config.source = "static".into();
        assert!(matches!(
            LocationSource::from_config(&config),
            Err(LocationError::MissingCoordinates)
        ));
        config.lat = Some(10.0);
        config.lon = Some(20.0);
        assert_eq!(
            LocationSource::from_config(&config).unwrap(),
            LocationSource::Static(Fix { lat: 10.0, lon: 20.0 })
        );

        config.source = "gps".into();
        assert!(matches!(
            LocationSource::from_config(&config),
            Err(LocationError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn reader_skips_bad_lines() {
        let input: &[u8] = b"1.0,2.0\n\nnot a fix\n{\"lat\": 3.0, \"lon\": 4.0}\n";
        let (tx, mut rx) = mpsc::channel(8);
        read_fixes(input, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(Fix { lat: 1.0, lon: 2.0 }));
        assert_eq!(rx.recv().await, Some(Fix { lat: 3.0, lon: 4.0 }));
        assert_eq!(rx.recv().await, None);
    }
}
