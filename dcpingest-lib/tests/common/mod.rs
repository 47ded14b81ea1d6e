#![allow(dead_code)]
use std::{
    io::Write,
    net::{SocketAddr, TcpListener},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam::channel::Receiver;
use dcpingest::{downlink::HDLC_HEADER, goes::format_goes_time, message::DcpMsg};

/// Upper bound on how long a test waits for anything to happen.
pub const WAIT: Duration = Duration::from_secs(10);

/// MO session from IMEI 123456789012345: MOMSN 1, session time 2024-06-10T06:13:20Z,
/// one opaque element (id 2) containing "HELLO".
pub const SBD_HELLO: &str = concat!(
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

pub fn sbd_hello() -> Vec<u8> {
    hex::decode(SBD_HELLO).unwrap()
}

/// A GOES header followed by `data`.
pub fn goes_message(address: &str, xmit: &DateTime<Utc>, failure_code: char, data: &[u8]) -> Vec<u8> {
    let mut dat = format!(
        "{address:8}{}{failure_code}44+0NN117EXE{:05}",
        format_goes_time(xmit),
        data.len()
    )
    .into_bytes();
    dat.extend_from_slice(data);
    dat
}

/// A downlink frame carrying all of `data` as a single packet message.
pub fn downlink_frame(msg_seq: u16, data: &[u8]) -> Vec<u8> {
    let mut body = HDLC_HEADER.to_vec();
    body.push(0);
    body.extend_from_slice(&msg_seq.to_be_bytes());
    body.push(1);
    body.extend_from_slice(data);
    let mut dat = u16::try_from(body.len()).unwrap().to_be_bytes().to_vec();
    dat.extend_from_slice(&body);
    dat
}

/// Accept `replies.len()` connections, writing the next reply to each and then
/// holding it open for `hold` before closing.
pub fn serve(replies: Vec<Vec<u8>>, hold: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            if stream.write_all(&reply).is_err() {
                continue;
            }
            thread::sleep(hold);
        }
    });
    addr
}

/// Like [serve], but each connection is handled on its own thread so later
/// connections are answered while earlier ones are still held open.
pub fn serve_concurrent(replies: Vec<Vec<u8>>, hold: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            thread::spawn(move || {
                if stream.write_all(&reply).is_ok() {
                    thread::sleep(hold);
                }
            });
        }
    });
    addr
}

pub fn recv_msg(rx: &Receiver<DcpMsg>) -> DcpMsg {
    rx.recv_timeout(WAIT).expect("a message to be archived")
}

/// Poll `cond` until it holds or [WAIT] runs out.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}
