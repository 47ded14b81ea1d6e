use std::io::{self, Read};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::goes::{format_goes_time, parse_goes_time};
use crate::message::{DcpMsg, MsgFlags, MsgType, SourceType};

/// The only protocol version understood.
pub const PROTOCOL_VERSION: u8 = 1;

/// Protocol header: version and total length.
const PROTOCOL_HEADER_LEN: usize = 3;
/// Information element header: id and length.
const IE_HEADER_LEN: usize = 3;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SbdError {
    #[error("Unsupported protocol version {0}")]
    Version(u8),

    #[error("First element must be the MO header (id 1, len 28), got id {id} len {len}")]
    FirstElement { id: u8, len: u16 },

    #[error("Element {id} with length {len} exceeds the {remaining} bytes remaining")]
    Overrun { id: u8, len: u16, remaining: usize },

    #[error("{remaining} trailing bytes too short for an element header")]
    Trailing { remaining: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Mobile-originated header element (IE 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoHeader {
    /// Gateway call detail record reference number.
    pub cdr_ref: u32,
    /// 15 digit device IMEI.
    pub imei: String,
    pub session_status: u8,
    /// Mobile-originated message sequence number.
    pub momsn: u16,
    /// Mobile-terminated message sequence number.
    pub mtmsn: u16,
    pub session_time: DateTime<Utc>,
}

impl MoHeader {
    pub const ID: u8 = 1;
    pub const LEN: u16 = 28;
    const IMEI_LEN: usize = 15;

    fn decode(dat: &[u8]) -> Self {
        let epoch = u32::from_be_bytes([dat[24], dat[25], dat[26], dat[27]]);
        MoHeader {
            cdr_ref: u32::from_be_bytes([dat[0], dat[1], dat[2], dat[3]]),
            imei: String::from_utf8_lossy(&dat[4..4 + Self::IMEI_LEN]).into_owned(),
            session_status: dat[19],
            momsn: u16::from_be_bytes([dat[20], dat[21]]),
            mtmsn: u16::from_be_bytes([dat[22], dat[23]]),
            session_time: DateTime::from_timestamp(i64::from(epoch), 0).unwrap_or_default(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.cdr_ref.to_be_bytes());
        let mut imei = [b' '; Self::IMEI_LEN];
        let n = self.imei.len().min(Self::IMEI_LEN);
        imei[..n].copy_from_slice(&self.imei.as_bytes()[..n]);
        buf.extend_from_slice(&imei);
        buf.push(self.session_status);
        buf.extend_from_slice(&self.momsn.to_be_bytes());
        buf.extend_from_slice(&self.mtmsn.to_be_bytes());
        let epoch = u32::try_from(self.session_time.timestamp()).unwrap_or_default();
        buf.extend_from_slice(&epoch.to_be_bytes());
    }

    /// Recover the header fields from text produced by [SbdSession::header_text].
    #[must_use]
    pub fn from_header_text(text: &str) -> Option<Self> {
        let mut imei = None;
        let mut time = None;
        let mut status = None;
        let mut momsn = None;
        let mut mtmsn = None;
        let mut cdr = None;
        for field in text.trim_end().split(',') {
            let (key, val) = field.split_once('=')?;
            match key {
                "ID" => imei = Some(val.to_string()),
                "TIME" => time = parse_goes_time(val),
                "STAT" => status = val.parse().ok(),
                "MO" => momsn = val.parse().ok(),
                "MT" => mtmsn = val.parse().ok(),
                "CDR" => cdr = u32::from_str_radix(val, 16).ok(),
                _ => {}
            }
        }
        Some(MoHeader {
            cdr_ref: cdr?,
            imei: imei?,
            session_status: status?,
            momsn: momsn?,
            mtmsn: mtmsn?,
            session_time: time?,
        })
    }
}

/// Location element (IE 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub south: bool,
    pub west: bool,
    pub lat_degrees: u8,
    /// Thousandths of a minute.
    pub lat_minutes: u16,
    pub lon_degrees: u8,
    /// Thousandths of a minute.
    pub lon_minutes: u16,
    /// Circular error probable radius, km.
    pub cep_radius: u32,
}

impl Location {
    pub const ID: u8 = 3;
    pub const LEN: u16 = 11;

    const SOUTH: u8 = 0b10;
    const WEST: u8 = 0b01;

    fn decode(dat: &[u8]) -> Self {
        Location {
            south: dat[0] & Self::SOUTH != 0,
            west: dat[0] & Self::WEST != 0,
            lat_degrees: dat[1],
            lat_minutes: u16::from_be_bytes([dat[2], dat[3]]),
            lon_degrees: dat[4],
            lon_minutes: u16::from_be_bytes([dat[5], dat[6]]),
            cep_radius: u32::from_be_bytes([dat[7], dat[8], dat[9], dat[10]]),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let mut flags = 0;
        if self.south {
            flags |= Self::SOUTH;
        }
        if self.west {
            flags |= Self::WEST;
        }
        buf.push(flags);
        buf.push(self.lat_degrees);
        buf.extend_from_slice(&self.lat_minutes.to_be_bytes());
        buf.push(self.lon_degrees);
        buf.extend_from_slice(&self.lon_minutes.to_be_bytes());
        buf.extend_from_slice(&self.cep_radius.to_be_bytes());
    }

    /// Signed decimal degrees, negative in the south.
    #[must_use]
    pub fn latitude(&self) -> f64 {
        let deg = f64::from(self.lat_degrees) + f64::from(self.lat_minutes) / 60_000.0;
        if self.south {
            -deg
        } else {
            deg
        }
    }

    /// Signed decimal degrees, negative in the west.
    #[must_use]
    pub fn longitude(&self) -> f64 {
        let deg = f64::from(self.lon_degrees) + f64::from(self.lon_minutes) / 60_000.0;
        if self.west {
            -deg
        } else {
            deg
        }
    }
}

/// An element carried through to the message unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationElement {
    pub id: u8,
    pub data: Vec<u8>,
}

/// One decoded mobile-originated SBD session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbdSession {
    pub version: u8,
    pub header: MoHeader,
    pub location: Option<Location>,
    /// Elements other than the MO header and location, in arrival order.
    pub elements: Vec<InformationElement>,
}

fn read_ie_header<R: Read>(reader: &mut R, remaining: &mut usize) -> Result<(u8, u16), SbdError> {
    if *remaining < IE_HEADER_LEN {
        return Err(SbdError::Trailing {
            remaining: *remaining,
        });
    }
    let mut hdr = [0u8; IE_HEADER_LEN];
    reader.read_exact(&mut hdr)?;
    *remaining -= IE_HEADER_LEN;
    let id = hdr[0];
    let len = u16::from_be_bytes([hdr[1], hdr[2]]);
    if usize::from(len) > *remaining {
        return Err(SbdError::Overrun {
            id,
            len,
            remaining: *remaining,
        });
    }
    Ok((id, len))
}

fn read_ie_data<R: Read>(reader: &mut R, len: u16, remaining: &mut usize) -> Result<Vec<u8>, SbdError> {
    let mut data = vec![0u8; usize::from(len)];
    reader.read_exact(&mut data)?;
    *remaining -= data.len();
    Ok(data)
}

impl SbdSession {
    /// A session with just a MO header.
    #[must_use]
    pub fn new(header: MoHeader) -> Self {
        SbdSession {
            version: PROTOCOL_VERSION,
            header,
            location: None,
            elements: Vec::new(),
        }
    }

    /// Read exactly one session from `reader`.
    ///
    /// Reads no further than the length declared in the protocol header.
    ///
    /// # Errors
    /// [SbdError] on an unsupported version, a first element that is not the MO
    /// header, an element that does not fit the declared length, or if the stream
    /// ends early.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, SbdError> {
        let mut hdr = [0u8; PROTOCOL_HEADER_LEN];
        reader.read_exact(&mut hdr)?;
        let version = hdr[0];
        if version != PROTOCOL_VERSION {
            return Err(SbdError::Version(version));
        }
        let mut remaining = usize::from(u16::from_be_bytes([hdr[1], hdr[2]]));

        let (id, len) = read_ie_header(reader, &mut remaining)?;
        if id != MoHeader::ID || len != MoHeader::LEN {
            return Err(SbdError::FirstElement { id, len });
        }
        let header = MoHeader::decode(&read_ie_data(reader, len, &mut remaining)?);

        let mut session = SbdSession {
            version,
            header,
            location: None,
            elements: Vec::new(),
        };
        while remaining > 0 {
            let (id, len) = read_ie_header(reader, &mut remaining)?;
            let data = read_ie_data(reader, len, &mut remaining)?;
            if id == Location::ID && len == Location::LEN {
                session.location = Some(Location::decode(&data));
            } else {
                session.elements.push(InformationElement { id, data });
            }
        }
        Ok(session)
    }

    /// Encode to the wire format read by [Self::read].
    ///
    /// # Errors
    /// If the elements do not fit in the 16 bit total length.
    pub fn encode(&self) -> Result<Vec<u8>, SbdError> {
        let mut body = Vec::new();
        body.push(MoHeader::ID);
        body.extend_from_slice(&MoHeader::LEN.to_be_bytes());
        self.header.encode(&mut body);
        if let Some(loc) = &self.location {
            body.push(Location::ID);
            body.extend_from_slice(&Location::LEN.to_be_bytes());
            loc.encode(&mut body);
        }
        for ie in &self.elements {
            let len = u16::try_from(ie.data.len()).map_err(|_| SbdError::Overrun {
                id: ie.id,
                len: u16::MAX,
                remaining: ie.data.len(),
            })?;
            body.push(ie.id);
            body.extend_from_slice(&len.to_be_bytes());
            body.extend_from_slice(&ie.data);
        }
        let total = u16::try_from(body.len()).map_err(|_| SbdError::Overrun {
            id: 0,
            len: u16::MAX,
            remaining: body.len(),
        })?;

        let mut buf = Vec::with_capacity(PROTOCOL_HEADER_LEN + body.len());
        buf.push(self.version);
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Text header of the archived message, newline terminated.
    ///
    /// `ID=<imei>,TIME=<YYDDDHHMMSS>,STAT=<nn>,MO=<nnnnn>,MT=<nnnnn>,CDR=<hex>` with
    /// `,LAT=<deg>,LON=<deg>,RAD=<km>` appended when a location was sent.
    #[must_use]
    pub fn header_text(&self) -> String {
        let h = &self.header;
        let mut text = format!(
            "ID={},TIME={},STAT={:02},MO={:05},MT={:05},CDR={:08X}",
            h.imei,
            format_goes_time(&h.session_time),
            h.session_status,
            h.momsn,
            h.mtmsn,
            h.cdr_ref
        );
        if let Some(loc) = &self.location {
            text.push_str(&format!(
                ",LAT={:.5},LON={:.5},RAD={}",
                loc.latitude(),
                loc.longitude(),
                loc.cep_radius
            ));
        }
        text.push('\n');
        text
    }

    /// Opaque elements, each prefixed with `IE<id>:`, newline separated.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (idx, ie) in self.elements.iter().enumerate() {
            if idx > 0 {
                payload.push(b'\n');
            }
            payload.extend_from_slice(format!("IE{:02}:", ie.id).as_bytes());
            payload.extend_from_slice(&ie.data);
        }
        payload
    }

    /// Session status 0-2 indicate a successful transfer.
    #[must_use]
    pub fn failure_code(&self) -> char {
        if self.header.session_status <= 2 {
            'G'
        } else {
            '?'
        }
    }

    /// The canonical message for this session. The sequence number is the MOMSN.
    #[must_use]
    pub fn into_msg(self, recv_time: DateTime<Utc>) -> DcpMsg {
        DcpMsg::builder()
            .header(self.header_text())
            .payload(self.payload())
            .seq_num(u32::from(self.header.momsn))
            .flags(MsgFlags::new(SourceType::Iridium, MsgType::Iridium))
            .recv_time(recv_time)
            .xmit_time(Some(self.header.session_time))
            .failure_code(self.failure_code())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_case;

    // version 1, len 39, MO header (ref 1, imei 123456789012345, status 0, MO 1, MT 0,
    // time 1718000000), IE 2 "HELLO"
    const HELLO: &str = concat!(
        "010027",
        "01001c",
        "00000001",
        "313233343536373839303132333435",
        "00",
        "0001",
        "0000",
        "66669980",
        "020005",
        "48454c4c4f",
    );

    fn hello() -> Vec<u8> {
        hex::decode(HELLO).unwrap()
    }

    #[test]
    fn decode_hello_session() {
        let session = SbdSession::read(&mut &hello()[..]).unwrap();

        assert_eq!(session.header.cdr_ref, 1);
        assert_eq!(session.header.imei, "123456789012345");
        assert_eq!(session.header.momsn, 1);
        assert_eq!(session.header.mtmsn, 0);
        assert_eq!(
            session.header.session_time,
            Utc.timestamp_opt(1_718_000_000, 0).unwrap()
        );
        assert!(session.location.is_none());
        assert_eq!(session.elements, vec![InformationElement { id: 2, data: b"HELLO".to_vec() }]);

        let msg = session.into_msg(Utc::now());
        assert!(msg.header().starts_with("ID=123456789012345,"));
        assert_eq!(
            msg.header(),
            "ID=123456789012345,TIME=24162061320,STAT=00,MO=00001,MT=00000,CDR=00000001\n"
        );
        assert_eq!(msg.payload(), b"IE02:HELLO");
        assert_eq!(msg.seq_num(), Some(1));
        assert_eq!(msg.failure_code(), 'G');
    }

    #[test]
    fn encode_matches_wire_bytes() {
        let session = SbdSession::read(&mut &hello()[..]).unwrap();
        assert_eq!(hex::encode(session.encode().unwrap()), HELLO);
    }

    #[test]
    fn header_text_inverse() {
        let session = SbdSession::read(&mut &hello()[..]).unwrap();
        let parsed = MoHeader::from_header_text(&session.header_text()).unwrap();
        assert_eq!(parsed, session.header);
    }

    fn random_session(rng: &mut StdRng) -> SbdSession {
        let imei: String = (0..15)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        // GOES times carry a two digit year
        let epoch = rng.gen_range(946_684_800..4_102_444_800i64);
        let mut session = SbdSession::new(MoHeader {
            cdr_ref: rng.gen(),
            imei,
            session_status: rng.gen_range(0..100),
            momsn: rng.gen(),
            mtmsn: rng.gen(),
            session_time: DateTime::from_timestamp(epoch, 0).unwrap(),
        });
        if rng.gen_bool(0.5) {
            session.location = Some(Location {
                south: rng.gen(),
                west: rng.gen(),
                lat_degrees: rng.gen_range(0..90),
                lat_minutes: rng.gen_range(0..60_000),
                lon_degrees: rng.gen_range(0..180),
                lon_minutes: rng.gen_range(0..60_000),
                cep_radius: rng.gen_range(0..2000),
            });
        }
        for _ in 0..rng.gen_range(0..4) {
            let mut data = vec![0u8; rng.gen_range(0..200)];
            rng.fill(&mut data[..]);
            // any id but the MO header and location
            let id = rng.gen_range(4..=u8::MAX);
            session.elements.push(InformationElement { id, data });
        }
        session
    }

    #[test]
    fn random_sessions_survive_encode_and_header_text() {
        let mut rng = StdRng::seed_from_u64(0x5bd);
        for _ in 0..500 {
            let session = random_session(&mut rng);

            let encoded = session.encode().unwrap();
            let decoded = SbdSession::read(&mut &encoded[..]).unwrap();
            assert_eq!(decoded, session);

            let parsed = MoHeader::from_header_text(&decoded.header_text()).unwrap();
            assert_eq!(parsed, session.header);
        }
    }

    #[test]
    fn location_element() {
        let mut session = SbdSession::read(&mut &hello()[..]).unwrap();
        session.location = Some(Location {
            south: true,
            west: true,
            lat_degrees: 33,
            lat_minutes: 30_000,
            lon_degrees: 70,
            lon_minutes: 15_000,
            cep_radius: 4,
        });
        let encoded = session.encode().unwrap();
        assert_eq!(&encoded[1..3], &(39u16 + 14).to_be_bytes());

        let decoded = SbdSession::read(&mut &encoded[..]).unwrap();
        let loc = decoded.location.as_ref().unwrap();
        assert!((loc.latitude() + 33.5).abs() < 1e-9);
        assert!((loc.longitude() + 70.25).abs() < 1e-9);
        assert!(decoded
            .header_text()
            .ends_with(",LAT=-33.50000,LON=-70.25000,RAD=4\n"));
    }

    #[test]
    fn short_location_is_opaque() {
        // IE 3 with the wrong length
        let mut dat = hello();
        dat[2] += 5;
        dat.extend_from_slice(&hex::decode("03000201020304").unwrap()[..5]);
        let session = SbdSession::read(&mut &dat[..]).unwrap();
        assert!(session.location.is_none());
        assert_eq!(session.elements[1], InformationElement { id: 3, data: vec![1, 2] });
    }

    #[test_case("020027", SbdError::Version(2) ; "bad version")]
    #[test_case("010027020005", SbdError::FirstElement { id: 2, len: 5 } ; "first element not header")]
    #[test_case("010027010010", SbdError::FirstElement { id: 1, len: 16 } ; "header wrong length")]
    #[test_case("01000201001c", SbdError::Trailing { remaining: 2 } ; "declared length too short")]
    fn structural_errors(prefix: &str, expected: SbdError) {
        let mut dat = hex::decode(prefix).unwrap();
        dat.extend_from_slice(&[0u8; 64]);
        let err = SbdSession::read(&mut &dat[..]).unwrap_err();
        assert_eq!(format!("{err:?}"), format!("{expected:?}"));
    }

    #[test]
    fn element_overrunning_declared_length() {
        let mut dat = hello();
        // declare 2 fewer bytes than the HELLO element needs
        dat[2] -= 2;
        let err = SbdSession::read(&mut &dat[..]).unwrap_err();
        assert!(matches!(err, SbdError::Overrun { id: 2, len: 5, remaining: 3 }));
    }

    #[test]
    fn truncated_stream() {
        let dat = hello();
        let err = SbdSession::read(&mut &dat[..dat.len() - 2]).unwrap_err();
        assert!(matches!(err, SbdError::Io(_)));
    }

    #[test]
    fn failed_session_status_is_questionable() {
        let mut session = SbdSession::read(&mut &hello()[..]).unwrap();
        session.header.session_status = 10;
        assert_eq!(session.failure_code(), '?');
    }
}
