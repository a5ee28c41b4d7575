//! NMEA 0183 sentence decoding for the two types the pipeline consumes
//! (GGA fix data, RMC recommended minimum). Anything else that passes the
//! checksum comes back as `Unrecognized` so the reader can count it without
//! caring what it was.
//!
//! Every field is either fully present and numerically valid or explicitly
//! absent. An empty coordinate field decodes to `None`, never to zero —
//! 0.0° is a real place.

use chrono::{NaiveDate, NaiveTime};

use crate::error::NmeaError;

/// GGA quality indicator, collapsed to the classes the pipeline acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixQuality {
    NoFix,
    Gps,
    Dgps,
}

impl FixQuality {
    /// Quality indicator field → class. 0 is no fix, 2 is differential,
    /// any other non-zero mode still counts as a usable single-point fix.
    fn from_indicator(value: u8) -> Self {
        match value {
            0 => FixQuality::NoFix,
            2 => FixQuality::Dgps,
            _ => FixQuality::Gps,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixQuality::NoFix => "none",
            FixQuality::Gps => "gps",
            FixQuality::Dgps => "dgps",
        }
    }

    pub fn usable(&self) -> bool {
        *self != FixQuality::NoFix
    }
}

/// Global positioning fix data.
#[derive(Clone, Debug, PartialEq)]
pub struct GgaSentence {
    pub talker: String,
    pub utc: Option<NaiveTime>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality: FixQuality,
    pub satellites: Option<u32>,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
}

/// Recommended minimum data. A void sentence (`status == false`) is a
/// well-formed sentence that reports "no valid fix" — not malformed input.
#[derive(Clone, Debug, PartialEq)]
pub struct RmcSentence {
    pub talker: String,
    pub utc: Option<NaiveTime>,
    pub date: Option<NaiveDate>,
    pub active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
    pub course_deg: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Sentence {
    Gga(GgaSentence),
    Rmc(RmcSentence),
    Unrecognized { sentence_type: String },
}

/// Decode one line of serial text. Checksum failures and malformed payloads
/// reject the whole sentence; no partial result escapes.
pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    let body = line
        .strip_prefix('$')
        .ok_or_else(|| NmeaError::Malformed("missing '$' start delimiter".to_string()))?;

    let (payload, checksum_text) = body
        .rsplit_once('*')
        .ok_or_else(|| NmeaError::Malformed("missing '*' checksum delimiter".to_string()))?;

    let expected = u8::from_str_radix(checksum_text.trim(), 16)
        .map_err(|_| NmeaError::Malformed(format!("bad checksum field {checksum_text:?}")))?;
    let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if computed != expected {
        return Err(NmeaError::Checksum { expected, computed });
    }

    let fields: Vec<&str> = payload.split(',').collect();
    let address = fields[0];
    if address.len() < 5 || !address.is_ascii() {
        return Err(NmeaError::Malformed(format!("bad address field {address:?}")));
    }
    let talker = address[..address.len() - 3].to_string();
    let sentence_type = &address[address.len() - 3..];

    match sentence_type {
        "GGA" => parse_gga(talker, &fields).map(Sentence::Gga),
        "RMC" => parse_rmc(talker, &fields).map(Sentence::Rmc),
        other => Ok(Sentence::Unrecognized {
            sentence_type: other.to_string(),
        }),
    }
}

fn parse_gga(talker: String, fields: &[&str]) -> Result<GgaSentence, NmeaError> {
    if fields.len() < 10 {
        return Err(NmeaError::Malformed(format!(
            "GGA carries {} fields, expected at least 10",
            fields.len()
        )));
    }

    let quality = match opt_field(fields[6]) {
        None => FixQuality::NoFix,
        Some(text) => FixQuality::from_indicator(parse_num::<u8>(text, "fix quality")?),
    };

    Ok(GgaSentence {
        talker,
        utc: parse_time(fields[1])?,
        latitude: parse_coordinate(fields[2], fields[3], CoordinateAxis::Latitude)?,
        longitude: parse_coordinate(fields[4], fields[5], CoordinateAxis::Longitude)?,
        quality,
        satellites: opt_field(fields[7])
            .map(|t| parse_num::<u32>(t, "satellite count"))
            .transpose()?,
        hdop: opt_field(fields[8])
            .map(|t| parse_num::<f64>(t, "HDOP"))
            .transpose()?,
        altitude: opt_field(fields[9])
            .map(|t| parse_num::<f64>(t, "altitude"))
            .transpose()?,
    })
}

fn parse_rmc(talker: String, fields: &[&str]) -> Result<RmcSentence, NmeaError> {
    if fields.len() < 10 {
        return Err(NmeaError::Malformed(format!(
            "RMC carries {} fields, expected at least 10",
            fields.len()
        )));
    }

    let active = match fields[2] {
        "A" | "a" => true,
        "V" | "v" | "" => false,
        other => {
            return Err(NmeaError::Malformed(format!("bad RMC status flag {other:?}")));
        }
    };

    Ok(RmcSentence {
        talker,
        utc: parse_time(fields[1])?,
        date: parse_date(fields[9])?,
        active,
        latitude: parse_coordinate(fields[3], fields[4], CoordinateAxis::Latitude)?,
        longitude: parse_coordinate(fields[5], fields[6], CoordinateAxis::Longitude)?,
        speed_knots: opt_field(fields[7])
            .map(|t| parse_num::<f64>(t, "ground speed"))
            .transpose()?,
        course_deg: opt_field(fields[8])
            .map(|t| parse_num::<f64>(t, "course"))
            .transpose()?,
    })
}

#[derive(Clone, Copy)]
enum CoordinateAxis {
    Latitude,
    Longitude,
}

/// Degree-minute encoding (`ddmm.mmmm` / `dddmm.mmmm`) plus hemisphere →
/// signed decimal degrees. An empty value field is "absent", not an error and
/// not zero; a value with no hemisphere is malformed.
fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    axis: CoordinateAxis,
) -> Result<Option<f64>, NmeaError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let raw = parse_num::<f64>(value, "coordinate")?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if minutes >= 60.0 {
        return Err(NmeaError::Malformed(format!("coordinate minutes out of range in {value:?}")));
    }
    let unsigned = degrees + minutes / 60.0;

    let (limit, pos, neg) = match axis {
        CoordinateAxis::Latitude => (90.0, "N", "S"),
        CoordinateAxis::Longitude => (180.0, "E", "W"),
    };
    if unsigned > limit {
        return Err(NmeaError::Malformed(format!("coordinate {value:?} exceeds {limit} degrees")));
    }

    let hemisphere = hemisphere.trim();
    if hemisphere.eq_ignore_ascii_case(pos) {
        Ok(Some(unsigned))
    } else if hemisphere.eq_ignore_ascii_case(neg) {
        Ok(Some(-unsigned))
    } else {
        Err(NmeaError::Malformed(format!(
            "coordinate {value:?} with missing or bad hemisphere {hemisphere:?}"
        )))
    }
}

/// `hhmmss` with optional fractional seconds → time of day.
fn parse_time(value: &str) -> Result<Option<NaiveTime>, NmeaError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if whole.len() != 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NmeaError::Malformed(format!("bad time field {value:?}")));
    }
    let hour: u32 = whole[0..2].parse().unwrap();
    let minute: u32 = whole[2..4].parse().unwrap();
    let second: u32 = whole[4..6].parse().unwrap();

    let nanos = if frac.is_empty() {
        0
    } else {
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NmeaError::Malformed(format!("bad time fraction in {value:?}")));
        }
        let digits: String = frac.chars().take(9).collect();
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().unwrap() * scale
    };

    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
        .ok_or_else(|| NmeaError::Malformed(format!("time field {value:?} out of range")))
        .map(Some)
}

/// `ddmmyy` → date, pivoting two-digit years into 2000+.
fn parse_date(value: &str) -> Result<Option<NaiveDate>, NmeaError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NmeaError::Malformed(format!("bad date field {value:?}")));
    }
    let day: u32 = value[0..2].parse().unwrap();
    let month: u32 = value[2..4].parse().unwrap();
    let year: i32 = 2000 + value[4..6].parse::<i32>().unwrap();

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| NmeaError::Malformed(format!("date field {value:?} out of range")))
        .map(Some)
}

fn opt_field(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, NmeaError> {
    value
        .parse::<T>()
        .map_err(|_| NmeaError::Malformed(format!("bad {what} field {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Wrap a payload with the correct '*hh' trailer.
    fn with_checksum(payload: &str) -> String {
        let sum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${payload}*{sum:02X}")
    }

    #[test]
    fn test_gga_reference_sentence() {
        // Classic receiver-manual example with its published checksum.
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let parsed = parse_sentence(line).unwrap();
        let gga = match parsed {
            Sentence::Gga(g) => g,
            other => panic!("expected GGA, got {other:?}"),
        };

        assert_eq!(gga.talker, "GP");
        assert_eq!(gga.utc, NaiveTime::from_hms_opt(12, 35, 19));
        assert_relative_eq!(gga.latitude.unwrap(), 48.1173, epsilon = 1e-4);
        assert_relative_eq!(gga.longitude.unwrap(), 11.5166, epsilon = 1e-3);
        assert_eq!(gga.quality, FixQuality::Gps);
        assert_eq!(gga.satellites, Some(8));
        assert_relative_eq!(gga.hdop.unwrap(), 0.9);
        assert_relative_eq!(gga.altitude.unwrap(), 545.4);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48";
        match parse_sentence(line) {
            Err(NmeaError::Checksum { expected, computed }) => {
                assert_eq!(expected, 0x48);
                assert_eq!(computed, 0x47);
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_case_insensitive() {
        let payload = "GPGGA,120000,,,,,0,00,,,M,,M,,";
        let sum = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        assert!(parse_sentence(&format!("${payload}*{sum:02X}")).is_ok());
        assert!(parse_sentence(&format!("${payload}*{sum:02x}")).is_ok());
    }

    #[test]
    fn test_zero_coordinates_are_present() {
        // Gulf of Guinea: a legitimate 0°N 0°E fix must decode as present.
        let line = with_checksum("GPGGA,120000,0000.000,N,00000.000,E,1,05,1.0,10.0,M,,M,,");
        let gga = match parse_sentence(&line).unwrap() {
            Sentence::Gga(g) => g,
            other => panic!("expected GGA, got {other:?}"),
        };
        assert_eq!(gga.latitude, Some(0.0));
        assert_eq!(gga.longitude, Some(0.0));
    }

    #[test]
    fn test_empty_coordinates_are_absent() {
        let line = with_checksum("GPGGA,120000,,,,,0,00,,,M,,M,,");
        let gga = match parse_sentence(&line).unwrap() {
            Sentence::Gga(g) => g,
            other => panic!("expected GGA, got {other:?}"),
        };
        assert_eq!(gga.latitude, None);
        assert_eq!(gga.longitude, None);
        assert_eq!(gga.quality, FixQuality::NoFix);
        assert_eq!(gga.altitude, None);
    }

    #[test]
    fn test_southern_western_hemispheres_negative() {
        let line = with_checksum("GPGGA,120000,3342.120,S,07040.500,W,2,09,0.8,520.0,M,,M,,");
        let gga = match parse_sentence(&line).unwrap() {
            Sentence::Gga(g) => g,
            other => panic!("expected GGA, got {other:?}"),
        };
        assert_relative_eq!(gga.latitude.unwrap(), -33.702, epsilon = 1e-3);
        assert_relative_eq!(gga.longitude.unwrap(), -70.675, epsilon = 1e-3);
        assert_eq!(gga.quality, FixQuality::Dgps);
    }

    #[test]
    fn test_value_without_hemisphere_is_malformed() {
        let line = with_checksum("GPGGA,120000,4807.038,,01131.000,E,1,08,0.9,545.4,M,,M,,");
        assert!(matches!(parse_sentence(&line), Err(NmeaError::Malformed(_))));
    }

    #[test]
    fn test_rmc_active_with_date_and_subsecond_time() {
        let line = with_checksum("GPRMC,225446.25,A,4916.45,N,12311.12,W,000.5,054.7,191124,,");
        let rmc = match parse_sentence(&line).unwrap() {
            Sentence::Rmc(r) => r,
            other => panic!("expected RMC, got {other:?}"),
        };
        assert!(rmc.active);
        assert_eq!(rmc.utc, NaiveTime::from_hms_milli_opt(22, 54, 46, 250));
        assert_eq!(rmc.date, NaiveDate::from_ymd_opt(2024, 11, 19));
        assert_relative_eq!(rmc.latitude.unwrap(), 49.2742, epsilon = 1e-4);
        assert_relative_eq!(rmc.longitude.unwrap(), -123.1853, epsilon = 1e-4);
        assert_relative_eq!(rmc.speed_knots.unwrap(), 0.5);
    }

    #[test]
    fn test_void_rmc_is_well_formed_not_malformed() {
        let line = with_checksum("GPRMC,225446,V,,,,,,,191124,,");
        let rmc = match parse_sentence(&line).unwrap() {
            Sentence::Rmc(r) => r,
            other => panic!("expected RMC, got {other:?}"),
        };
        assert!(!rmc.active);
        assert_eq!(rmc.latitude, None);
        assert_eq!(rmc.longitude, None);
        // Time and date still decode; validity is a separate axis.
        assert_eq!(rmc.utc, NaiveTime::from_hms_opt(22, 54, 46));
        assert!(rmc.date.is_some());
    }

    #[test]
    fn test_unrecognized_type_passes_checksum() {
        let line = with_checksum("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K");
        match parse_sentence(&line).unwrap() {
            Sentence::Unrecognized { sentence_type } => assert_eq!(sentence_type, "VTG"),
            other => panic!("expected unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_lines_malformed() {
        assert!(matches!(parse_sentence(""), Err(NmeaError::Malformed(_))));
        assert!(matches!(parse_sentence("GPGGA,no,dollar"), Err(NmeaError::Malformed(_))));
        assert!(matches!(parse_sentence("$GPGGA,no,star"), Err(NmeaError::Malformed(_))));
        assert!(matches!(parse_sentence("$GPGGA,bad*GZ"), Err(NmeaError::Malformed(_))));
    }

    #[test]
    fn test_truncated_gga_malformed() {
        let line = with_checksum("GPGGA,120000,4807.038,N");
        assert!(matches!(parse_sentence(&line), Err(NmeaError::Malformed(_))));
    }

    #[test]
    fn test_quality_indicator_mapping() {
        assert_eq!(FixQuality::from_indicator(0), FixQuality::NoFix);
        assert_eq!(FixQuality::from_indicator(1), FixQuality::Gps);
        assert_eq!(FixQuality::from_indicator(2), FixQuality::Dgps);
        // Unknown augmentation modes still count as a usable fix.
        assert_eq!(FixQuality::from_indicator(5), FixQuality::Gps);
        assert!(FixQuality::Gps.usable());
        assert!(!FixQuality::NoFix.usable());
    }
}
