//! # Remote Bitbang Client
//!
//! A blocking client for OpenOCD remote bitbang servers. It speaks the same byte protocol
//! as OpenOCD's `remote_bitbang` adapter driver and is mostly useful for scripting a JTAG
//! chain without OpenOCD, and for testing servers.
//!
//! ## Overview
//!
//! Every protocol command is exposed as a method. Commands are written unbuffered, and
//! [BitbangClient::sample] blocks until the server answered. For anything longer than a few
//! commands, [BitbangClient::execute] sends a batch with a single write and collects the
//! samples afterwards, which avoids one round trip per sample. Large batches are split so
//! that the unread samples always fit into the socket buffers.
//!
//! ## Basic Usage
//!
//! ### Connecting to a Server
//!
//! ```ignore
//! use rbb_client::BitbangClient;
//!
//! let mut client = BitbangClient::new("127.0.0.1:2222")?;
//! client.reset(false, false)?;
//! client.blink(true)?;
//! ```
//!
//! ### Performing JTAG Shifts
//!
//! ```ignore
//! // Shift 8 bits with TMS low through the chain
//! let tdo = client.shift(8, &[0x00], &[0xA5])?;
//! println!("TDO data: {:?}", tdo);
//! ```
//!
//! ## Related Crates
//!
//! - [`rbb_server`](https://docs.rs/rbb-server/) - Server implementation
//! - [`rbb_protocol`](https://docs.rs/rbb-protocol/) - Protocol encoding/decoding
use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use rbb_protocol::{
    Command,
    codec::{read_sample, read_samples},
    error::ReadError,
};

/// Largest number of samples requested before they are read back
const MAX_SAMPLES_PER_WRITE: usize = 4096;

/// Remote bitbang client for driving JTAG signals remotely.
pub struct BitbangClient {
    tcp: TcpStream,
}

impl BitbangClient {
    pub fn new(addr: impl ToSocketAddrs) -> io::Result<BitbangClient> {
        let tcp = TcpStream::connect(addr)?;
        tcp.set_nodelay(true)?;
        Ok(BitbangClient { tcp })
    }

    /// Drive TCK, TMS and TDI.
    pub fn write(&mut self, tck: bool, tms: bool, tdi: bool) -> io::Result<()> {
        Command::Write { tck, tms, tdi }.write_to(&mut self.tcp)
    }

    /// Drive the reset lines. `true` asserts the line.
    pub fn reset(&mut self, trst: bool, srst: bool) -> io::Result<()> {
        Command::Reset { trst, srst }.write_to(&mut self.tcp)
    }

    /// Sample TDO.
    pub fn sample(&mut self) -> Result<bool, ReadError> {
        Command::Sample.write_to(&mut self.tcp)?;
        read_sample(&mut self.tcp)
    }

    pub fn blink(&mut self, on: bool) -> io::Result<()> {
        Command::Blink(on).write_to(&mut self.tcp)
    }

    /// Let the server pause for `duration`, rounded down to whole microseconds.
    pub fn sleep(&mut self, duration: Duration) -> io::Result<()> {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let commands: Vec<Command> = Command::sleep(micros).collect();
        Command::write_all_to(&commands, &mut self.tcp)
    }

    /// Announce the end of the session. The connection stays open.
    pub fn quit(&mut self) -> io::Result<()> {
        Command::Quit.write_to(&mut self.tcp)
    }

    /// Send a batch of commands and return the TDO level for every [Command::Sample]
    /// in the batch.
    pub fn execute(&mut self, commands: &[Command]) -> Result<Vec<bool>, ReadError> {
        let mut samples = Vec::new();
        let mut rest = commands;
        while !rest.is_empty() {
            let (batch, expected) = split_batch(rest, MAX_SAMPLES_PER_WRITE);
            Command::write_all_to(batch, &mut self.tcp)?;
            samples.extend(read_samples(&mut self.tcp, expected)?);
            rest = &rest[batch.len()..];
        }
        Ok(samples)
    }

    /// Perform a JTAG shift operation.
    ///
    /// Bit `i` of the vectors is bit `i % 8` of byte `i / 8`. For every bit, TMS and TDI
    /// are set up with TCK low, TDO is sampled, and TCK is raised.
    ///
    /// # Arguments
    ///
    /// * `num_bits` - Number of bits to shift
    /// * `tms` - Test Mode Select vector (length must be at least ⌈num_bits / 8⌉)
    /// * `tdi` - Test Data In vector (length must be at least ⌈num_bits / 8⌉)
    ///
    /// # Returns
    ///
    /// Test Data Out vector of ⌈num_bits / 8⌉ bytes.
    pub fn shift(&mut self, num_bits: u32, tms: &[u8], tdi: &[u8]) -> Result<Box<[u8]>, ReadError> {
        let num_bytes = num_bits.div_ceil(8) as usize;
        if tms.len() < num_bytes || tdi.len() < num_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bits need vectors of {} bytes", num_bits, num_bytes),
            )
            .into());
        }

        let mut commands = Vec::with_capacity(num_bits as usize * 3);
        for i in 0..num_bits as usize {
            let tms = bit(tms, i);
            let tdi = bit(tdi, i);
            commands.push(Command::Write {
                tck: false,
                tms,
                tdi,
            });
            commands.push(Command::Sample);
            commands.push(Command::Write {
                tck: true,
                tms,
                tdi,
            });
        }
        let samples = self.execute(&commands)?;

        let mut tdo = vec![0u8; num_bytes];
        for (i, level) in samples.into_iter().enumerate() {
            if level {
                tdo[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(tdo.into_boxed_slice())
    }
}

fn bit(vector: &[u8], index: usize) -> bool {
    vector[index / 8] & (1 << (index % 8)) != 0
}

/// Longest prefix of `commands` with at most `max_samples` samples, and its sample count.
/// The prefix is never empty.
fn split_batch(commands: &[Command], max_samples: usize) -> (&[Command], usize) {
    let mut samples = 0;
    for (i, command) in commands.iter().enumerate() {
        if command.has_response() {
            if samples == max_samples.max(1) {
                return (&commands[..i], samples);
            }
            samples += 1;
        }
    }
    (commands, samples)
}

#[test]
fn bits_are_lsb_first() {
    let vector = [0b0000_0101, 0b1000_0000];
    let bits: Vec<bool> = (0..16).map(|i| bit(&vector, i)).collect();
    assert!(bits[0] && !bits[1] && bits[2]);
    assert!(bits[15]);
    assert_eq!(bits.iter().filter(|b| **b).count(), 3);
}

#[test]
fn batches_are_split_before_the_sample_limit() {
    let write = Command::Write {
        tck: false,
        tms: false,
        tdi: true,
    };
    let commands = [
        write,
        Command::Sample,
        write,
        Command::Sample,
        write,
        Command::Sample,
    ];
    // The write after the second sample still belongs to the first batch
    let (batch, samples) = split_batch(&commands, 2);
    assert_eq!(batch.len(), 5);
    assert_eq!(samples, 2);

    let (batch, samples) = split_batch(&commands[5..], 2);
    assert_eq!(batch, &[Command::Sample]);
    assert_eq!(samples, 1);

    let writes = [write, write];
    let (batch, samples) = split_batch(&writes, 2);
    assert_eq!(batch.len(), 2);
    assert_eq!(samples, 0);
}
