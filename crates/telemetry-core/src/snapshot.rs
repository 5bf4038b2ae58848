//! Normalized flight telemetry and the store holding the latest reading.
//!
//! Units are fixed regardless of source: degrees for angles and positions,
//! feet for altitudes, knots for speeds and feet per minute for vertical speed.

use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Latest known flight state. Every field is optional because the UDP
/// protocol delivers partial updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Altitude above mean sea level (feet).
    #[serde(default, rename = "MSL", skip_serializing_if = "Option::is_none")]
    pub altitude_msl: Option<f64>,
    /// Altitude above ground level (feet).
    #[serde(default, rename = "AGL", skip_serializing_if = "Option::is_none")]
    pub altitude_agl: Option<f64>,
    /// Magnetic heading (degrees).
    #[serde(default, rename = "heading", skip_serializing_if = "Option::is_none")]
    pub magnetic_heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicated_airspeed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_airspeed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groundspeed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<f64>,
    /// Vertical speed (feet per minute).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_speed: Option<f64>,
}

/// Addressable snapshot field, used by decode tables to name their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotField {
    Latitude,
    Longitude,
    AltitudeMsl,
    AltitudeAgl,
    MagneticHeading,
    TrueHeading,
    IndicatedAirspeed,
    TrueAirspeed,
    Groundspeed,
    Pitch,
    Roll,
    VerticalSpeed,
}

impl SnapshotField {
    pub const ALL: [SnapshotField; 12] = [
        SnapshotField::Latitude,
        SnapshotField::Longitude,
        SnapshotField::AltitudeMsl,
        SnapshotField::AltitudeAgl,
        SnapshotField::MagneticHeading,
        SnapshotField::TrueHeading,
        SnapshotField::IndicatedAirspeed,
        SnapshotField::TrueAirspeed,
        SnapshotField::Groundspeed,
        SnapshotField::Pitch,
        SnapshotField::Roll,
        SnapshotField::VerticalSpeed,
    ];
}

impl TelemetrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, field: SnapshotField) -> &mut Option<f64> {
        match field {
            SnapshotField::Latitude => &mut self.latitude,
            SnapshotField::Longitude => &mut self.longitude,
            SnapshotField::AltitudeMsl => &mut self.altitude_msl,
            SnapshotField::AltitudeAgl => &mut self.altitude_agl,
            SnapshotField::MagneticHeading => &mut self.magnetic_heading,
            SnapshotField::TrueHeading => &mut self.true_heading,
            SnapshotField::IndicatedAirspeed => &mut self.indicated_airspeed,
            SnapshotField::TrueAirspeed => &mut self.true_airspeed,
            SnapshotField::Groundspeed => &mut self.groundspeed,
            SnapshotField::Pitch => &mut self.pitch,
            SnapshotField::Roll => &mut self.roll,
            SnapshotField::VerticalSpeed => &mut self.vertical_speed,
        }
    }

    pub fn get(&self, field: SnapshotField) -> Option<f64> {
        match field {
            SnapshotField::Latitude => self.latitude,
            SnapshotField::Longitude => self.longitude,
            SnapshotField::AltitudeMsl => self.altitude_msl,
            SnapshotField::AltitudeAgl => self.altitude_agl,
            SnapshotField::MagneticHeading => self.magnetic_heading,
            SnapshotField::TrueHeading => self.true_heading,
            SnapshotField::IndicatedAirspeed => self.indicated_airspeed,
            SnapshotField::TrueAirspeed => self.true_airspeed,
            SnapshotField::Groundspeed => self.groundspeed,
            SnapshotField::Pitch => self.pitch,
            SnapshotField::Roll => self.roll,
            SnapshotField::VerticalSpeed => self.vertical_speed,
        }
    }

    pub fn set(&mut self, field: SnapshotField, value: f64) {
        *self.slot_mut(field) = Some(value);
    }

    /// Overlay every populated field of `update`; absent fields keep their
    /// current value.
    pub fn merge_from(&mut self, update: &TelemetrySnapshot) {
        for field in SnapshotField::ALL {
            if let Some(value) = update.get(field) {
                self.set(field, value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        SnapshotField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    pub fn populated_fields(&self) -> usize {
        SnapshotField::ALL
            .iter()
            .filter(|f| self.get(**f).is_some())
            .count()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    snapshot: TelemetrySnapshot,
    updated_at: Option<Instant>,
}

/// Holder of the single latest snapshot.
///
/// Only the active adapter writes. The lock makes that single-writer rule hold
/// on a multi-threaded runtime too; it is never held across an await.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: RwLock<StoreInner>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> TelemetrySnapshot {
        self.inner.read().snapshot.clone()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.inner.read().updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().snapshot.is_empty()
    }

    /// Merge a partial update and return the resulting snapshot.
    pub fn merge(&self, update: &TelemetrySnapshot) -> TelemetrySnapshot {
        let mut inner = self.inner.write();
        inner.snapshot.merge_from(update);
        inner.updated_at = Some(Instant::now());
        inner.snapshot.clone()
    }

    /// Replace the whole snapshot and return it.
    pub fn replace(&self, snapshot: TelemetrySnapshot) -> TelemetrySnapshot {
        let mut inner = self.inner.write();
        inner.snapshot = snapshot;
        inner.updated_at = Some(Instant::now());
        inner.snapshot.clone()
    }
}
