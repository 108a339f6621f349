use std::fmt::Display;

use crate::error::ReadError;

/// A single remote bitbang command.
/// Every command occupies exactly one byte on the wire; there is no framing and no length prefix.
/// Only [Command::Sample] produces a response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Drive TCK, TMS and TDI at the same time. Encoded as `'0'..='7'`,
    /// where bit 0 is TDI, bit 1 is TMS and bit 2 is TCK.
    Write { tck: bool, tms: bool, tdi: bool },
    /// Drive the reset pair. Encoded as `'r'..='u'`, where bit 0 of the offset to `'r'` is SRST
    /// and bit 1 is TRST. A set bit asserts the reset.
    Reset { trst: bool, srst: bool },
    /// Sample TDO. The server answers with a single byte, `'0'` or `'1'`.
    Sample,
    /// Switch the indicator on (`'B'`) or off (`'b'`).
    Blink(bool),
    /// Sleep for one millisecond (`'Z'`).
    SleepMillis,
    /// Sleep for one microsecond (`'z'`).
    SleepMicros,
    /// The client is about to disconnect (`'Q'`).
    Quit,
}

impl Command {
    const WRITE_BASE: u8 = b'0';
    const RESET_BASE: u8 = b'r';
    const SAMPLE: u8 = b'R';
    const BLINK_ON: u8 = b'B';
    const BLINK_OFF: u8 = b'b';
    const SLEEP_MILLIS: u8 = b'Z';
    const SLEEP_MICROS: u8 = b'z';
    const QUIT: u8 = b'Q';

    /// Decodes a command byte.
    /// Returns [ReadError::UnknownCommand] for bytes outside the command vocabulary.
    pub fn from_byte(byte: u8) -> Result<Command, ReadError> {
        match byte {
            b'0'..=b'7' => Ok(Command::Write {
                tck: byte & 0b100 != 0,
                tms: byte & 0b010 != 0,
                tdi: byte & 0b001 != 0,
            }),
            b'r'..=b'u' => {
                let bits = byte - Self::RESET_BASE;
                Ok(Command::Reset {
                    trst: bits & 0b10 != 0,
                    srst: bits & 0b01 != 0,
                })
            }
            Self::SAMPLE => Ok(Command::Sample),
            // Bit 5 distinguishes upper from lower case
            Self::BLINK_ON | Self::BLINK_OFF => Ok(Command::Blink(byte & 0x20 == 0)),
            Self::SLEEP_MILLIS => Ok(Command::SleepMillis),
            Self::SLEEP_MICROS => Ok(Command::SleepMicros),
            Self::QUIT => Ok(Command::Quit),
            _ => Err(ReadError::UnknownCommand(byte)),
        }
    }

    /// The wire representation of this command
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Write { tck, tms, tdi } => {
                Self::WRITE_BASE | (u8::from(tck) << 2) | (u8::from(tms) << 1) | u8::from(tdi)
            }
            Command::Reset { trst, srst } => {
                Self::RESET_BASE + ((u8::from(trst) << 1) | u8::from(srst))
            }
            Command::Sample => Self::SAMPLE,
            Command::Blink(true) => Self::BLINK_ON,
            Command::Blink(false) => Self::BLINK_OFF,
            Command::SleepMillis => Self::SLEEP_MILLIS,
            Command::SleepMicros => Self::SLEEP_MICROS,
            Command::Quit => Self::QUIT,
        }
    }

    /// Returns the sleep commands that make up a delay of `micros` microseconds:
    /// one [Command::SleepMillis] per whole millisecond, followed by one
    /// [Command::SleepMicros] per remaining microsecond.
    pub fn sleep(micros: u64) -> impl Iterator<Item = Command> {
        let millis = (micros / 1000) as usize;
        let rest = (micros % 1000) as usize;
        std::iter::repeat_n(Command::SleepMillis, millis)
            .chain(std::iter::repeat_n(Command::SleepMicros, rest))
    }

    /// Whether the server answers this command
    pub fn has_response(&self) -> bool {
        matches!(self, Command::Sample)
    }
}

impl TryFrom<u8> for Command {
    type Error = ReadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Command::from_byte(value)
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        value.to_byte()
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Write { tck, tms, tdi } => write!(
                f,
                "write(tck={}, tms={}, tdi={})",
                u8::from(*tck),
                u8::from(*tms),
                u8::from(*tdi)
            ),
            Command::Reset { trst, srst } => {
                write!(f, "reset(trst={}, srst={})", u8::from(*trst), u8::from(*srst))
            }
            Command::Sample => write!(f, "sample"),
            Command::Blink(on) => write!(f, "blink({})", if *on { "on" } else { "off" }),
            Command::SleepMillis => write!(f, "sleep(1ms)"),
            Command::SleepMicros => write!(f, "sleep(1us)"),
            Command::Quit => write!(f, "quit"),
        }
    }
}

/// Encodes a sampled TDO level as response byte.
pub fn encode_sample(tdo: bool) -> u8 {
    b'0' | u8::from(tdo)
}

/// Decodes a response byte into the sampled TDO level.
pub fn decode_sample(byte: u8) -> Result<bool, ReadError> {
    match byte {
        b'0' => Ok(false),
        b'1' => Ok(true),
        other => Err(ReadError::InvalidSample(other)),
    }
}

#[test]
fn write_commands_map_low_bits() {
    for byte in b'0'..=b'7' {
        let bits = byte & 0b111;
        assert_eq!(
            Command::from_byte(byte).unwrap(),
            Command::Write {
                tck: bits & 4 != 0,
                tms: bits & 2 != 0,
                tdi: bits & 1 != 0,
            }
        );
        assert_eq!(Command::from_byte(byte).unwrap().to_byte(), byte);
    }
}

#[test]
fn reset_commands_map_offset() {
    assert_eq!(
        Command::from_byte(b'r').unwrap(),
        Command::Reset {
            trst: false,
            srst: false
        }
    );
    assert_eq!(
        Command::from_byte(b's').unwrap(),
        Command::Reset {
            trst: false,
            srst: true
        }
    );
    assert_eq!(
        Command::from_byte(b't').unwrap(),
        Command::Reset {
            trst: true,
            srst: false
        }
    );
    assert_eq!(
        Command::from_byte(b'u').unwrap(),
        Command::Reset {
            trst: true,
            srst: true
        }
    );
}

#[test]
fn blink_uses_bit_five() {
    assert_eq!(Command::from_byte(b'B').unwrap(), Command::Blink(true));
    assert_eq!(Command::from_byte(b'b').unwrap(), Command::Blink(false));
}

#[test]
fn unknown_bytes_are_rejected() {
    for byte in [b'X', b'8', b'q', b'v', 0x00, 0xff] {
        assert!(matches!(
            Command::from_byte(byte),
            Err(ReadError::UnknownCommand(b)) if b == byte
        ));
    }
}

#[test]
fn sleep_splits_into_millis_and_micros() {
    let commands: Vec<_> = Command::sleep(2003).collect();
    assert_eq!(commands.len(), 5);
    assert!(commands[..2].iter().all(|c| *c == Command::SleepMillis));
    assert!(commands[2..].iter().all(|c| *c == Command::SleepMicros));
    assert_eq!(Command::sleep(0).count(), 0);
}

#[test]
fn sample_encoding() {
    assert_eq!(encode_sample(false), b'0');
    assert_eq!(encode_sample(true), b'1');
    assert!(decode_sample(b'1').unwrap());
    assert!(matches!(decode_sample(b'2'), Err(ReadError::InvalidSample(b'2'))));
}
