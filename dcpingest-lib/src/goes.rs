//! GOES/DOMSAT message header.
//!
//! Network DCPs and the satellite downlink both deliver messages prefixed with the
//! 37 byte ASCII header below. All offsets are zero-based.
//!
//! | Offset | Len | Field                                   |
//! |-------:|----:|-----------------------------------------|
//! |      0 |   8 | DCP address (hex)                       |
//! |      8 |  11 | Transmit time `YYDDDHHMMSS`             |
//! |     19 |   1 | Failure code                            |
//! |     20 |   2 | Signal strength                         |
//! |     22 |   2 | Frequency offset                        |
//! |     24 |   1 | Modulation index                        |
//! |     25 |   1 | Data quality                            |
//! |     26 |   3 | GOES channel                            |
//! |     29 |   1 | Spacecraft                              |
//! |     30 |   2 | Uplink/DRGS code                        |
//! |     32 |   5 | Data length (decimal)                   |
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Decoded fields of a GOES/DOMSAT message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoesHeader {
    pub address: String,
    /// Transmit time, `None` if the time field does not parse.
    pub xmit_time: Option<DateTime<Utc>>,
    pub failure_code: char,
    pub channel: Option<u16>,
    pub spacecraft: char,
    /// Number of data bytes following the header.
    pub data_length: usize,
}

impl GoesHeader {
    /// Header length in bytes
    pub const LEN: usize = 37;
    /// Largest data length accepted, limited by the 5 digit length field.
    pub const MAX_DATA_LENGTH: usize = 99_800;

    const IDX_TIME: usize = 8;
    const IDX_FAILCODE: usize = 19;
    const IDX_CHANNEL: usize = 26;
    const IDX_SPACECRAFT: usize = 29;
    const IDX_DATALENGTH: usize = 32;

    /// Decode from the first [Self::LEN] bytes of `dat`, or `None` if there are not
    /// enough bytes, or the address or length fields are invalid.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < Self::LEN {
            return None;
        }
        let address = std::str::from_utf8(&dat[..Self::IDX_TIME]).ok()?;
        if !address.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let data_length: usize = ascii_field(dat, Self::IDX_DATALENGTH, 5)?.parse().ok()?;
        if data_length > Self::MAX_DATA_LENGTH {
            return None;
        }

        Some(GoesHeader {
            address: address.to_string(),
            xmit_time: ascii_field(dat, Self::IDX_TIME, 11).and_then(parse_goes_time),
            failure_code: dat[Self::IDX_FAILCODE] as char,
            channel: ascii_field(dat, Self::IDX_CHANNEL, 3).and_then(|s| s.trim().parse().ok()),
            spacecraft: dat[Self::IDX_SPACECRAFT] as char,
            data_length,
        })
    }

    /// True when the failure code marks a normal DCP message rather than an
    /// abnormal received message (ARM) report.
    #[must_use]
    pub fn is_dcp_message(&self) -> bool {
        self.failure_code == 'G' || self.failure_code == '?'
    }
}

fn ascii_field(dat: &[u8], start: usize, len: usize) -> Option<&str> {
    std::str::from_utf8(dat.get(start..start + len)?).ok()
}

/// Parse a `YYDDDHHMMSS` time. Two-digit years are in the 2000s.
#[must_use]
pub fn parse_goes_time(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != 11 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..2].parse().ok()?;
    let doy: u32 = s[2..5].parse().ok()?;
    let hour: u32 = s[5..7].parse().ok()?;
    let min: u32 = s[7..9].parse().ok()?;
    let sec: u32 = s[9..11].parse().ok()?;
    let naive = NaiveDate::from_yo_opt(2000 + year, doy)?.and_hms_opt(hour, min, sec)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Format a time as `YYDDDHHMMSS`.
#[must_use]
pub fn format_goes_time(t: &DateTime<Utc>) -> String {
    format!(
        "{:02}{:03}{:02}{:02}{:02}",
        t.year() % 100,
        t.ordinal(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8; 37] = b"CE7A5A3224292153012G44+0NN118EXE00012";

    #[test]
    fn decode_header() {
        let hdr = GoesHeader::decode(HEADER).unwrap();

        assert_eq!(hdr.address, "CE7A5A32");
        assert_eq!(
            hdr.xmit_time,
            Some(Utc.with_ymd_and_hms(2024, 10, 18, 15, 30, 12).unwrap())
        );
        assert_eq!(hdr.failure_code, 'G');
        assert_eq!(hdr.channel, Some(118));
        assert_eq!(hdr.spacecraft, 'E');
        assert_eq!(hdr.data_length, 12);
        assert!(hdr.is_dcp_message());
    }

    #[test]
    fn decode_header_is_none_when_too_short() {
        assert!(GoesHeader::decode(&HEADER[..36]).is_none());
    }

    #[test]
    fn decode_header_is_none_for_bad_length() {
        let mut dat = HEADER.to_vec();
        dat[33] = b'x';
        assert!(GoesHeader::decode(&dat).is_none());
    }

    #[test]
    fn decode_header_is_none_for_bad_address() {
        let mut dat = HEADER.to_vec();
        dat[0] = b'Z';
        assert!(GoesHeader::decode(&dat).is_none());
    }

    #[test]
    fn bad_time_still_decodes() {
        let mut dat = HEADER.to_vec();
        dat[10] = b'9'; // day 992
        let hdr = GoesHeader::decode(&dat).unwrap();
        assert!(hdr.xmit_time.is_none());
    }

    #[test]
    fn goes_time_format_roundtrip() {
        let t = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let s = format_goes_time(&t);
        assert_eq!(s, "25002030405");
        assert_eq!(parse_goes_time(&s), Some(t));
    }
}
