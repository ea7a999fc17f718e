//! NMEA GPGGA decoding and nearest-station selection.

use geoutils::Location;
use tracing::{debug, trace, warn};

use crate::config::Station;
use crate::error::ProtocolError;

/// A parsed GPGGA fix.
#[derive(Clone, PartialEq, Debug)]
pub struct GpggaFix {
    pub time: String,
    pub latitude: f64,
    pub longitude: f64,
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
    pub geoid_height: Option<f64>,
    pub dgps_age: Option<f64>,
    pub dgps_station_id: Option<String>,
}

/// Parse an NMEA `DDDMM.MMMM` coordinate into decimal degrees.
///
/// Degrees = floor(x / 100), minutes = x - 100 * degrees, decimal = degrees + minutes / 60.
pub fn parse_lat_lon(raw: &str) -> Option<f64> {
    let x: f64 = raw.parse().ok()?;
    if !x.is_finite() {
        return None;
    }
    let degrees = (x / 100.0).floor();
    let minutes = x - 100.0 * degrees;
    Some(degrees + minutes / 60.0)
}

/// Verify the NMEA checksum. Does not affect whether the sentence is accepted
/// (see the open question in the module's governing design note): a mismatch
/// is only logged.
fn checksum_matches(data: &str, provided: &str) -> bool {
    let body = data.strip_prefix('$').unwrap_or(data);
    let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
    let provided = provided.trim();
    if provided.len() != 2 {
        return false;
    }
    match u8::from_str_radix(provided, 16) {
        Ok(p) => p == computed,
        Err(_) => false,
    }
}

/// Parse a single NMEA sentence as GPGGA/GNGGA. Returns `None` (with a
/// logged reason) when the sentence cannot be used for position tracking.
pub fn parse_gpgga(sentence: &str) -> Result<GpggaFix, ProtocolError> {
    let sentence = sentence.trim();

    let (data, checksum) = sentence
        .split_once('*')
        .ok_or_else(|| ProtocolError::MalformedGpgga("missing checksum delimiter".into()))?;

    if !checksum_matches(data, checksum) {
        warn!("GPGGA checksum mismatch for sentence: {}", sentence);
        // Coordinate data still flows; matches observed upstream behavior.
    }

    let fields: Vec<&str> = data.split(',').collect();
    if fields.len() < 15 {
        return Err(ProtocolError::MalformedGpgga(format!(
            "expected at least 15 fields, got {}",
            fields.len()
        )));
    }

    let talker = fields[0];
    if talker != "$GNGGA" && talker != "$GPGGA" {
        return Err(ProtocolError::MalformedGpgga(format!(
            "unrecognized talker/sentence id {talker}"
        )));
    }

    let time = fields[1].to_string();

    let lat_raw = fields[2];
    let lat_hemi = fields[3];
    let lon_raw = fields[4];
    let lon_hemi = fields[5];

    if lat_raw.is_empty() || lon_raw.is_empty() {
        return Err(ProtocolError::MalformedGpgga(
            "empty latitude or longitude field".into(),
        ));
    }

    let mut latitude = parse_lat_lon(lat_raw)
        .ok_or_else(|| ProtocolError::MalformedGpgga("unparseable latitude".into()))?;
    if lat_hemi == "S" {
        latitude = -latitude;
    }

    let mut longitude = parse_lat_lon(lon_raw)
        .ok_or_else(|| ProtocolError::MalformedGpgga("unparseable longitude".into()))?;
    if lon_hemi == "W" {
        longitude = -longitude;
    }

    let fix_quality = fields
        .get(6)
        .and_then(|s| s.parse::<u8>().ok())
        .filter(|q| *q <= 8)
        .unwrap_or(0);

    let satellites = fields.get(7).and_then(|s| s.parse::<u8>().ok()).unwrap_or(0);

    let hdop = fields.get(8).and_then(|s| s.parse::<f64>().ok());
    let altitude = fields.get(9).and_then(|s| s.parse::<f64>().ok());
    let geoid_height = fields.get(11).and_then(|s| s.parse::<f64>().ok());
    let dgps_age = fields.get(13).and_then(|s| s.parse::<f64>().ok());
    let dgps_station_id = fields
        .get(14)
        .map(|s| s.trim_end_matches(|c: char| c == '\r' || c == '\n'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    trace!(
        "parsed GPGGA: lat={:.6} lon={:.6} quality={} sats={}",
        latitude,
        longitude,
        fix_quality,
        satellites
    );

    Ok(GpggaFix {
        time,
        latitude,
        longitude,
        fix_quality,
        satellites,
        hdop,
        altitude,
        geoid_height,
        dgps_age,
        dgps_station_id,
    })
}

/// Great-circle distance in meters between two points.
pub fn haversine_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let from = Location::new(a.0, a.1);
    let to = Location::new(b.0, b.1);
    from.distance_to(&to)
        .map(|d| d.meters())
        .unwrap_or(f64::INFINITY)
}

/// Find the nearest active station to `(lat, lon)`, among stations with
/// finite coordinates. Ties resolve to the first candidate in iteration
/// order.
pub fn find_closest_station<'a>(
    lat: f64,
    lon: f64,
    stations: &'a [Station],
) -> Option<(&'a Station, f64)> {
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }

    let mut best: Option<(&Station, f64)> = None;

    for station in stations {
        if !station.active {
            continue;
        }
        if !station.latitude.is_finite() || !station.longitude.is_finite() {
            continue;
        }

        let distance = haversine_distance((lat, lon), (station.latitude, station.longitude));
        match &best {
            Some((_, best_distance)) if *best_distance <= distance => {},
            _ => {
                debug!(
                    "candidate station {} at {:.3} m",
                    station.mount_point, distance
                );
                best = Some((station, distance));
            },
        }
    }

    best
}
