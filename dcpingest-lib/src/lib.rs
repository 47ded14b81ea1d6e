#![doc = include_str!("../README.md")]

mod error;

pub mod archive;
pub mod config;
pub mod downlink;
pub mod goes;
pub mod message;
pub mod polling;
pub mod sbd;
pub mod source;
pub mod status;

pub use error::{Error, Result};

pub(crate) mod prelude {
    pub use crate::error::{Error, Result};
}
