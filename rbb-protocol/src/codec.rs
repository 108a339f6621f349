/// Read and write implementations for commands and sample responses
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{Command, decode_sample, encode_sample},
};

impl Command {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&[self.to_byte()])
    }

    /// Writes a batch of commands with a single write call.
    pub fn write_all_to(commands: &[Command], writer: &mut impl Write) -> io::Result<()> {
        let bytes: Vec<u8> = commands.iter().map(|command| command.to_byte()).collect();
        writer.write_all(&bytes)
    }

    pub fn from_reader(reader: &mut impl Read) -> Result<Command, ReadError> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        Command::from_byte(buf[0])
    }
}

/// Reads a single sample response.
pub fn read_sample(reader: &mut impl Read) -> Result<bool, ReadError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    decode_sample(buf[0])
}

/// Reads `count` sample responses.
pub fn read_samples(reader: &mut impl Read, count: usize) -> Result<Vec<bool>, ReadError> {
    let mut buf = vec![0u8; count];
    reader.read_exact(&mut buf)?;
    buf.into_iter().map(decode_sample).collect()
}

pub fn write_sample(writer: &mut impl Write, tdo: bool) -> io::Result<()> {
    writer.write_all(&[encode_sample(tdo)])
}

#[cfg(feature = "tokio")]
mod framed {
    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{
        error::ReadError,
        protocol::{Command, decode_sample},
    };

    /// Client side codec for [tokio_util::codec::Framed].
    /// Encodes [Command]s and decodes sample responses into TDO levels.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ClientCodec;

    impl Encoder<Command> for ClientCodec {
        type Error = std::io::Error;

        fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
            dst.put_u8(item.to_byte());
            Ok(())
        }
    }

    impl Decoder for ClientCodec {
        type Item = bool;
        type Error = ReadError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            if src.is_empty() {
                return Ok(None);
            }
            decode_sample(src.get_u8()).map(Some)
        }
    }
}

#[cfg(feature = "tokio")]
pub use framed::ClientCodec;
