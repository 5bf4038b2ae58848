//! Aircraft data definition requested from SimConnect.
//!
//! Values arrive as one packed buffer in declaration order; identity is
//! positional, so [`AIRCRAFT_SCHEMA`] is both the declaration list and the
//! decode table.

use flight_bridge_telemetry_core::{SnapshotField, TelemetrySnapshot};
use thiserror::Error;

use super::binding::DataType;

pub const AIRCRAFT_DEFINITION: u32 = 0;
pub const AIRCRAFT_REQUEST: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub unit: &'static str,
    pub data_type: DataType,
    pub field: SnapshotField,
    pub scale: f64,
}

const fn float64(name: &'static str, unit: &'static str, field: SnapshotField) -> FieldSpec {
    FieldSpec {
        name,
        unit,
        data_type: DataType::Float64,
        field,
        scale: 1.0,
    }
}

pub const AIRCRAFT_SCHEMA: [FieldSpec; 12] = [
    float64("PLANE LATITUDE", "degrees", SnapshotField::Latitude),
    float64("PLANE LONGITUDE", "degrees", SnapshotField::Longitude),
    float64("PLANE ALTITUDE", "feet", SnapshotField::AltitudeMsl),
    float64("PLANE ALT ABOVE GROUND", "feet", SnapshotField::AltitudeAgl),
    float64(
        "PLANE HEADING DEGREES MAGNETIC",
        "degrees",
        SnapshotField::MagneticHeading,
    ),
    float64(
        "PLANE HEADING DEGREES TRUE",
        "degrees",
        SnapshotField::TrueHeading,
    ),
    float64(
        "AIRSPEED INDICATED",
        "knots",
        SnapshotField::IndicatedAirspeed,
    ),
    float64("AIRSPEED TRUE", "knots", SnapshotField::TrueAirspeed),
    float64("GROUND VELOCITY", "knots", SnapshotField::Groundspeed),
    float64("PLANE PITCH DEGREES", "degrees", SnapshotField::Pitch),
    float64("PLANE BANK DEGREES", "degrees", SnapshotField::Roll),
    FieldSpec {
        name: "VERTICAL SPEED",
        unit: "feet per second",
        data_type: DataType::Float64,
        field: SnapshotField::VerticalSpeed,
        scale: 60.0,
    },
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("SimConnect sample too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Payload size of one complete sample.
pub fn sample_len() -> usize {
    AIRCRAFT_SCHEMA.iter().map(|f| f.data_type.width()).sum()
}

/// Decode one packed sample. Short payloads are rejected whole; no partial
/// snapshot is produced.
pub fn decode_sample(payload: &[u8]) -> Result<TelemetrySnapshot, SampleError> {
    let expected = sample_len();
    if payload.len() < expected {
        return Err(SampleError::TooShort {
            expected,
            actual: payload.len(),
        });
    }

    let mut snapshot = TelemetrySnapshot::new();
    let mut offset = 0;
    for spec in &AIRCRAFT_SCHEMA {
        if let Some(raw) = read_value(payload, offset, spec.data_type) {
            snapshot.set(spec.field, raw * spec.scale);
        }
        offset += spec.data_type.width();
    }
    Ok(snapshot)
}

fn read_value(data: &[u8], offset: usize, data_type: DataType) -> Option<f64> {
    let bytes = data.get(offset..offset + data_type.width())?;
    match data_type {
        DataType::Float64 => bytes.try_into().ok().map(f64::from_le_bytes),
        DataType::Float32 => bytes
            .try_into()
            .ok()
            .map(f32::from_le_bytes)
            .map(f64::from),
        DataType::Int32 => bytes
            .try_into()
            .ok()
            .map(i32::from_le_bytes)
            .map(f64::from),
    }
}
