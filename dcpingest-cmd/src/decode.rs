use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dcpingest::{
    downlink::{read_synchronized_frames, MessageAssembler, PacketHeader},
    goes::GoesHeader,
    sbd::SbdSession,
};
use serde::Serialize;
use tracing::debug;

use crate::render::{self, Format};

#[derive(Debug, Serialize)]
struct ElementInfo {
    id: u8,
    len: usize,
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    imei: String,
    cdr_ref: u32,
    momsn: u16,
    mtmsn: u16,
    session_status: u8,
    session_time: DateTime<Utc>,
    failure_code: char,
    latitude: Option<f64>,
    longitude: Option<f64>,
    cep_radius: Option<u32>,
    elements: Vec<ElementInfo>,
}

impl From<&SbdSession> for SessionInfo {
    fn from(session: &SbdSession) -> Self {
        let hdr = &session.header;
        SessionInfo {
            imei: hdr.imei.clone(),
            cdr_ref: hdr.cdr_ref,
            momsn: hdr.momsn,
            mtmsn: hdr.mtmsn,
            session_status: hdr.session_status,
            session_time: hdr.session_time,
            failure_code: session.failure_code(),
            latitude: session.location.as_ref().map(|l| l.latitude()),
            longitude: session.location.as_ref().map(|l| l.longitude()),
            cep_radius: session.location.as_ref().map(|l| l.cep_radius),
            elements: session
                .elements
                .iter()
                .map(|ie| ElementInfo {
                    id: ie.id,
                    len: ie.data.len(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionsInfo {
    filename: String,
    sessions: Vec<SessionInfo>,
}

fn decode_sessions(fpath: &Path) -> Result<Vec<SbdSession>> {
    let mut reader = BufReader::new(File::open(fpath).context("opening input")?);
    let mut sessions = Vec::default();
    while !reader.fill_buf().context("reading input")?.is_empty() {
        let session = SbdSession::read(&mut reader)
            .with_context(|| format!("decoding session {}", sessions.len()))?;
        debug!(imei = %session.header.imei, momsn = session.header.momsn, "decoded session");
        sessions.push(session);
    }
    Ok(sessions)
}

pub fn sbd_decode(fpath: &Path, format: &Format) -> Result<()> {
    let info = SessionsInfo {
        filename: fpath.to_string_lossy().to_string(),
        sessions: decode_sessions(fpath)?.iter().map(SessionInfo::from).collect(),
    };
    render::write(format, SBD_TEMPLATE, &info)
}

const SBD_TEMPLATE: &str = r"{{ filename }}
================================================================================================
IMEI               MOMSN  MTMSN  Status  Code  Session time              Latitude   Longitude  IEs
------------------------------------------------------------------------------------------------
{{ #each sessions }}{{ rpad 15 imei }} {{ lpad 8 momsn }} {{ lpad 6 mtmsn }} {{ lpad 7 session_status }}  {{ lpad 4 failure_code }}  {{ rpad 24 session_time }} {{ lpad 9 latitude }} {{ lpad 11 longitude }}  {{ #each elements }}{{ id }}({{ len }}){{ #if @last }}{{ else }}, {{ /if }}{{ /each }}
{{ /each }}";

#[derive(Debug, Default, Serialize)]
struct SyncSummary {
    frames: usize,
    skipped_bytes: usize,
    short_frames: usize,
    messages: usize,
    dropped_partial: u64,
}

#[derive(Debug, Serialize)]
struct FrameInfo {
    index: usize,
    len: usize,
    skipped: usize,
    msg_seq: Option<u16>,
    pkt_seq: Option<u8>,
    more: Option<bool>,
}

#[derive(Debug, Serialize)]
struct MessageInfo {
    seq: u16,
    len: usize,
    address: Option<String>,
    failure_code: Option<char>,
    xmit_time: Option<DateTime<Utc>>,
    channel: Option<u16>,
    data_length: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SyncInfo {
    filename: String,
    summary: SyncSummary,
    frames: Vec<FrameInfo>,
    messages: Vec<MessageInfo>,
}

fn summarize_stream(fpath: &Path, capacity: usize) -> Result<SyncInfo> {
    let file = File::open(fpath).context("opening input")?;
    let mut summary = SyncSummary::default();
    let mut assembler = MessageAssembler::new();
    let mut frames = Vec::default();
    let mut messages = Vec::default();

    for frame in read_synchronized_frames(file, capacity) {
        let frame = frame.context("reading frames")?;
        let hdr = PacketHeader::decode(&frame.data);
        frames.push(FrameInfo {
            index: frames.len(),
            len: frame.data.len(),
            skipped: frame.skipped,
            msg_seq: hdr.map(|h| h.msg_seq),
            pkt_seq: hdr.map(|h| h.pkt_seq),
            more: hdr.map(|h| h.more),
        });
        summary.frames += 1;
        summary.skipped_bytes += frame.skipped;
        if hdr.is_none() {
            summary.short_frames += 1;
            continue;
        }
        let Some(msg) = assembler.push(&frame.data) else {
            continue;
        };
        let hdr = GoesHeader::decode(&msg.data);
        messages.push(MessageInfo {
            seq: msg.seq,
            len: msg.data.len(),
            address: hdr.as_ref().map(|h| h.address.clone()),
            failure_code: hdr.as_ref().map(|h| h.failure_code),
            xmit_time: hdr.as_ref().and_then(|h| h.xmit_time),
            channel: hdr.as_ref().and_then(|h| h.channel),
            data_length: hdr.as_ref().map(|h| h.data_length),
        });
    }
    summary.messages = messages.len();
    summary.dropped_partial = assembler.dropped;

    Ok(SyncInfo {
        filename: fpath.to_string_lossy().to_string(),
        summary,
        frames,
        messages,
    })
}

pub fn sync(fpath: &Path, capacity: usize, format: &Format) -> Result<()> {
    let info = summarize_stream(fpath, capacity)?;
    render::write(format, SYNC_TEMPLATE, &info)
}

const SYNC_TEMPLATE: &str = r"{{ filename }}
===========================================================================
Frames:   {{ summary.frames }}
Skipped:  {{ summary.skipped_bytes }} bytes
Short:    {{ summary.short_frames }}
Messages: {{ summary.messages }}
Dropped:  {{ summary.dropped_partial }}
---------------------------------------------------------------------------
Frame  Length  Skipped    Seq  Packet  More
---------------------------------------------------------------------------
{{ #each frames }}{{ lpad 5 index }}  {{ lpad 6 len }}  {{ lpad 7 skipped }}  {{ lpad 5 msg_seq }}  {{ lpad 6 pkt_seq }}  {{ more }}
{{ /each }}---------------------------------------------------------------------------
  Seq  Address   Code  Chan  Transmit time              Length  Data length
---------------------------------------------------------------------------
{{ #each messages }}{{ lpad 5 seq }}  {{ rpad 8 address }}  {{ lpad 4 failure_code }}  {{ lpad 4 channel }}  {{ rpad 24 xmit_time }} {{ lpad 7 len }}  {{ lpad 11 data_length }}
{{ /each }}";

#[cfg(test)]
mod tests {
    use std::io::Write;

    use dcpingest::downlink::HDLC_HEADER;

    use super::*;

    fn frame(msg_seq: u16, pkt_seq: u8, more: bool, data: &[u8]) -> Vec<u8> {
        let mut body = HDLC_HEADER.to_vec();
        body.push(if more { 0x10 } else { 0 });
        body.extend_from_slice(&msg_seq.to_be_bytes());
        body.push(pkt_seq);
        body.extend_from_slice(data);
        let mut dat = u16::try_from(body.len()).unwrap().to_be_bytes().to_vec();
        dat.extend_from_slice(&body);
        dat
    }

    #[test]
    fn summarizes_stream() {
        let goes = b"CE1234A024162061320G44+0NN117EXE00005HELLO";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xaa, 0xbb]).unwrap();
        file.write_all(&frame(5, 1, true, &goes[..20])).unwrap();
        file.write_all(&frame(5, 2, false, &goes[20..])).unwrap();
        file.write_all(&frame(6, 2, false, b"orphan")).unwrap();
        file.flush().unwrap();

        let info = summarize_stream(file.path(), 1024).unwrap();

        assert_eq!(info.summary.frames, 3);
        assert_eq!(info.summary.skipped_bytes, 2);
        assert_eq!(info.frames[0].skipped, 2);
        assert_eq!(info.frames[1].pkt_seq, Some(2));
        assert_eq!(info.frames[1].more, Some(false));
        assert_eq!(info.summary.messages, 1);
        let msg = &info.messages[0];
        assert_eq!(msg.seq, 5);
        assert_eq!(msg.len, goes.len());
        assert_eq!(msg.address.as_deref(), Some("CE1234A0"));
        assert_eq!(msg.data_length, Some(5));
    }

    #[test]
    fn decodes_back_to_back_sessions() {
        let dat = hex::decode(
            "01002701001c00000001313233343536373839303132333435000001000066669980020005\
             48454c4c4f",
        )
        .unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&dat).unwrap();
        file.write_all(&dat).unwrap();
        file.flush().unwrap();

        let sessions = decode_sessions(file.path()).unwrap();

        assert_eq!(sessions.len(), 2);
        let info = SessionInfo::from(&sessions[1]);
        assert_eq!(info.imei, "123456789012345");
        assert_eq!(info.failure_code, 'G');
        assert_eq!(info.elements[0].id, 2);
        assert_eq!(info.elements[0].len, 5);
    }

    #[test]
    fn truncated_session_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x01, 0x00, 0x27, 0x01]).unwrap();
        file.flush().unwrap();

        assert!(decode_sessions(file.path()).is_err());
    }
}
