//! X-Plane RREF dataref protocol.
//!
//! Request (413 bytes):
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 5    | `"RREF\0"` |
//! | 5      | 4    | frequency (i32 LE, per second; 0 cancels) |
//! | 9      | 4    | channel id (i32 LE) |
//! | 13     | 400  | dataref path, ASCII, zero padded |
//!
//! Response: `"RREF"`, one pad byte, then repeating 8-byte records of
//! (i32 LE id, f32 LE value).

use flight_bridge_telemetry_core::{SnapshotField, TelemetrySnapshot};
use thiserror::Error;

pub const RREF_TAG: &[u8; 4] = b"RREF";
pub const REQUEST_LEN: usize = 413;
pub const RESPONSE_HEADER_LEN: usize = 5;
pub const RECORD_LEN: usize = 8;

const FREQUENCY_OFFSET: usize = 5;
const ID_OFFSET: usize = 9;
const NAME_OFFSET: usize = 13;
/// Longest name that still leaves a terminating null.
const MAX_NAME_LEN: usize = REQUEST_LEN - NAME_OFFSET - 1;

pub const METERS_TO_FEET: f64 = 3.28084;
pub const PER_SECOND_TO_PER_MINUTE: f64 = 60.0;
pub const METERS_PER_SECOND_TO_FEET_PER_MINUTE: f64 = METERS_TO_FEET * PER_SECOND_TO_PER_MINUTE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RrefError {
    #[error("RREF datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Unrecognized datagram tag {0:?}")]
    UnrecognizedTag([u8; 4]),

    #[error("Dataref name is {len} bytes; at most {MAX_NAME_LEN} fit in a request")]
    NameTooLong { len: usize },
}

/// Unit conversion applied to a raw channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitConversion {
    Identity,
    MetersToFeet,
    MetersPerSecondToFeetPerMinute,
}

impl UnitConversion {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            UnitConversion::Identity => raw,
            UnitConversion::MetersToFeet => raw * METERS_TO_FEET,
            UnitConversion::MetersPerSecondToFeetPerMinute => {
                raw * METERS_PER_SECOND_TO_FEET_PER_MINUTE
            }
        }
    }
}

/// One requested dataref and where its value lands in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RrefChannel {
    pub id: i32,
    pub dataref: &'static str,
    pub field: SnapshotField,
    pub conversion: UnitConversion,
}

const fn channel_entry(
    id: i32,
    dataref: &'static str,
    field: SnapshotField,
    conversion: UnitConversion,
) -> RrefChannel {
    RrefChannel {
        id,
        dataref,
        field,
        conversion,
    }
}

/// The fixed channel table, shared by the request builder and the response
/// decoder.
pub const CHANNELS: [RrefChannel; 12] = [
    channel_entry(
        1,
        "sim/flightmodel/position/latitude",
        SnapshotField::Latitude,
        UnitConversion::Identity,
    ),
    channel_entry(
        2,
        "sim/flightmodel/position/longitude",
        SnapshotField::Longitude,
        UnitConversion::Identity,
    ),
    channel_entry(
        3,
        "sim/flightmodel/position/elevation",
        SnapshotField::AltitudeMsl,
        UnitConversion::MetersToFeet,
    ),
    channel_entry(
        4,
        "sim/flightmodel/position/y_agl",
        SnapshotField::AltitudeAgl,
        UnitConversion::MetersToFeet,
    ),
    channel_entry(
        5,
        "sim/flightmodel/position/mag_psi",
        SnapshotField::MagneticHeading,
        UnitConversion::Identity,
    ),
    channel_entry(
        6,
        "sim/flightmodel/position/true_psi",
        SnapshotField::TrueHeading,
        UnitConversion::Identity,
    ),
    channel_entry(
        7,
        "sim/flightmodel/position/indicated_airspeed",
        SnapshotField::IndicatedAirspeed,
        UnitConversion::Identity,
    ),
    channel_entry(
        8,
        "sim/flightmodel/position/true_airspeed",
        SnapshotField::TrueAirspeed,
        UnitConversion::Identity,
    ),
    channel_entry(
        9,
        "sim/flightmodel/position/groundspeed",
        SnapshotField::Groundspeed,
        UnitConversion::Identity,
    ),
    channel_entry(
        10,
        "sim/flightmodel/position/true_theta",
        SnapshotField::Pitch,
        UnitConversion::Identity,
    ),
    channel_entry(
        11,
        "sim/flightmodel/position/true_phi",
        SnapshotField::Roll,
        UnitConversion::Identity,
    ),
    channel_entry(
        12,
        "sim/flightmodel/position/vh_ind",
        SnapshotField::VerticalSpeed,
        // vh_ind is metres per second.
        UnitConversion::MetersPerSecondToFeetPerMinute,
    ),
];

pub fn channel(id: i32) -> Option<&'static RrefChannel> {
    CHANNELS.iter().find(|c| c.id == id)
}

/// A (name, id, frequency) request triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub name: String,
    pub id: i32,
    pub frequency_hz: i32,
}

impl RequestDescriptor {
    pub fn new(name: impl Into<String>, id: i32, frequency_hz: i32) -> Self {
        Self {
            name: name.into(),
            id,
            frequency_hz,
        }
    }

    pub fn for_channel(channel: &RrefChannel, frequency_hz: i32) -> Self {
        Self::new(channel.dataref, channel.id, frequency_hz)
    }
}

pub fn encode_request(request: &RequestDescriptor) -> Result<[u8; REQUEST_LEN], RrefError> {
    let name = request.name.as_bytes();
    if name.len() > MAX_NAME_LEN {
        return Err(RrefError::NameTooLong { len: name.len() });
    }

    let mut buf = [0u8; REQUEST_LEN];
    buf[..RREF_TAG.len()].copy_from_slice(RREF_TAG);
    buf[FREQUENCY_OFFSET..ID_OFFSET].copy_from_slice(&request.frequency_hz.to_le_bytes());
    buf[ID_OFFSET..NAME_OFFSET].copy_from_slice(&request.id.to_le_bytes());
    buf[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    Ok(buf)
}

pub fn decode_request(data: &[u8]) -> Result<RequestDescriptor, RrefError> {
    check_tag(data, NAME_OFFSET)?;
    let frequency_hz = read_i32_le(data, FREQUENCY_OFFSET).unwrap_or_default();
    let id = read_i32_le(data, ID_OFFSET).unwrap_or_default();
    let name_bytes = data.get(NAME_OFFSET..).unwrap_or_default();
    let end = name_bytes
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    Ok(RequestDescriptor {
        name,
        id,
        frequency_hz,
    })
}

/// Encoded subscription requests for every channel in [`CHANNELS`].
pub fn request_batch(frequency_hz: i32) -> Vec<[u8; REQUEST_LEN]> {
    CHANNELS
        .iter()
        .filter_map(|c| encode_request(&RequestDescriptor::for_channel(c, frequency_hz)).ok())
        .collect()
}

/// Decoded contents of one RREF response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RrefFrame {
    /// Fields carried by this datagram, already unit-converted.
    pub update: TelemetrySnapshot,
    /// Complete records seen, known or not.
    pub records: usize,
    pub unknown_ids: Vec<i32>,
    /// Known ids whose value was NaN or infinite.
    pub invalid_ids: Vec<i32>,
}

impl RrefFrame {
    pub fn has_data(&self) -> bool {
        !self.update.is_empty()
    }
}

pub fn decode_response(data: &[u8]) -> Result<RrefFrame, RrefError> {
    check_tag(data, RESPONSE_HEADER_LEN)?;

    let mut frame = RrefFrame::default();
    let body = data.get(RESPONSE_HEADER_LEN..).unwrap_or_default();
    // chunks_exact leaves a trailing partial record in the remainder.
    for record in body.chunks_exact(RECORD_LEN) {
        frame.records += 1;
        let (Some(id), Some(raw)) = (read_i32_le(record, 0), read_f32_le(record, 4)) else {
            continue;
        };
        let Some(channel) = channel(id) else {
            frame.unknown_ids.push(id);
            continue;
        };
        if !raw.is_finite() {
            frame.invalid_ids.push(id);
            continue;
        }
        frame
            .update
            .set(channel.field, channel.conversion.apply(f64::from(raw)));
    }
    Ok(frame)
}

/// Whether `data` starts with the RREF tag.
pub fn has_rref_tag(data: &[u8]) -> bool {
    data.starts_with(RREF_TAG)
}

fn check_tag(data: &[u8], min_len: usize) -> Result<(), RrefError> {
    if data.len() < min_len {
        return Err(RrefError::TooShort {
            expected: min_len,
            actual: data.len(),
        });
    }
    if !has_rref_tag(data) {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&data[..4]);
        return Err(RrefError::UnrecognizedTag(tag));
    }
    Ok(())
}

fn read_f32_le(data: &[u8], offset: usize) -> Option<f32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(f32::from_le_bytes)
}

fn read_i32_le(data: &[u8], offset: usize) -> Option<i32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_le_bytes)
}
