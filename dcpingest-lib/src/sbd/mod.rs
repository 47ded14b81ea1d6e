//! Iridium Short Burst Data (SBD) input.
//!
//! The Iridium gateway opens one TCP connection per mobile-originated message and
//! sends a single session: a 3 byte protocol header (version, total length) followed
//! by information elements, each a 1 byte id, a 2 byte length and data. All integers
//! are big-endian.
//!
//! | IE | Len | Contents                                                 |
//! |---:|----:|----------------------------------------------------------|
//! |  1 |  28 | CDR reference, IMEI, session status, MOMSN, MTMSN, time  |
//! |  3 |  11 | Location: hemisphere flags, lat/lon, CEP radius          |
//! |  * |   * | Carried to the message unparsed                          |
mod listener;
mod session;

pub use listener::SbdListener;
pub use session::{
    InformationElement, Location, MoHeader, SbdError, SbdSession, PROTOCOL_VERSION,
};
