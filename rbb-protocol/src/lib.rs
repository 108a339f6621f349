//! # Remote Bitbang Protocol Library
//!
//! This crate provides a Rust implementation of the
//! [OpenOCD remote bitbang](https://github.com/openocd-org/openocd/blob/master/doc/manual/jtag/drivers/remote_bitbang.txt)
//! protocol, which drives a JTAG bus signal by signal over a socket instead of a dedicated adapter.
//!
//! ## Overview
//!
//! The protocol is byte oriented. Every byte sent by the client is one command, and the only
//! command with a response is the sample request. This library allows you to:
//!
//! - Decode and encode command bytes
//! - Encode and decode TDO sample responses
//! - Split arbitrary delays into the protocol's sleep commands
//!
//! ## Commands
//!
//! | Byte            | Command                                   |
//! |-----------------|-------------------------------------------|
//! | `'0'` ..= `'7'` | Drive TCK (bit 2), TMS (bit 1), TDI (bit 0) |
//! | `'r'` ..= `'u'` | Drive TRST (bit 1) and SRST (bit 0) of the offset to `'r'` |
//! | `'R'`           | Sample TDO, answered with `'0'` or `'1'`  |
//! | `'B'` / `'b'`   | Indicator on / off                        |
//! | `'Z'` / `'z'`   | Sleep one millisecond / one microsecond   |
//! | `'Q'`           | Quit                                      |
//!
//! ## Basic Usage
//!
//! ### Decoding Commands
//!
//! ```
//! use rbb_protocol::Command;
//!
//! let command = Command::from_byte(b'5').expect("'5' is a valid command");
//! assert_eq!(command, Command::Write { tck: true, tms: false, tdi: true });
//! assert!(Command::from_byte(b'X').is_err());
//! ```
//!
//! ### Writing Commands to a Server
//!
//! ```
//! use rbb_protocol::Command;
//!
//! let mut buffer = Vec::new();
//! Command::write_all_to(&[Command::Reset { trst: true, srst: false }, Command::Sample], &mut buffer)
//!     .expect("Writing to vector shouldn't fail");
//! assert_eq!(buffer, b"tR");
//! ```
//!
//! ### Reading Samples
//!
//! ```
//! use rbb_protocol::codec::read_sample;
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(b"1");
//! assert!(read_sample(&mut reader).expect("Sample should parse"));
//! ```
//!
//! ## Error Handling
//!
//! This library uses the [`error::ReadError`] type for decoding errors.
//!
//! ## Features
//!
//! - `tokio`: enables [`codec::ClientCodec`] for use with `tokio_util::codec::Framed`.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
