//! Bounded byte FIFOs between the network side and the engine.
//!
//! Each [Fifo] has exactly one reader and one writer. The engine side uses the
//! non-blocking accessors ([Fifo::peek], [Fifo::pop], [Fifo::push]), the network side
//! uses [CommandWriter] and [SampleReader], which suspend until the FIFO is ready.
use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    buffer: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug)]
pub struct Fifo {
    state: Mutex<State>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl Fifo {
    pub fn new(capacity: usize) -> Arc<Fifo> {
        let capacity = capacity.max(1);
        Arc::new(Fifo {
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().buffer.is_empty()
    }

    /// The byte at the head of the FIFO, without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.state().buffer.front().copied()
    }

    pub fn pop(&self) -> Option<u8> {
        let byte = self.state().buffer.pop_front();
        if byte.is_some() {
            self.writable.notify_one();
        }
        byte
    }

    /// Whether a byte can be pushed. A closed FIFO always accepts and discards.
    pub fn is_writable(&self) -> bool {
        let state = self.state();
        state.closed || state.buffer.len() < self.capacity
    }

    /// Pushes a byte if there is space. Returns `false` if the byte was not stored.
    pub fn push(&self, byte: u8) -> bool {
        let mut state = self.state();
        if state.closed || state.buffer.len() >= self.capacity {
            return false;
        }
        state.buffer.push_back(byte);
        drop(state);
        self.readable.notify_one();
        true
    }

    /// Pushes as many bytes from `data` as fit, waiting until at least one fits.
    /// Returns the number of bytes stored.
    ///
    /// Cancel safe: when the returned future is dropped, no byte has been stored.
    pub async fn push_slice(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = self.state();
                if state.closed {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "FIFO has been closed",
                    ));
                }
                let space = self.capacity - state.buffer.len();
                if space > 0 {
                    let count = space.min(data.len());
                    state.buffer.extend(&data[..count]);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(count);
                }
            }
            self.writable.notified().await;
        }
    }

    /// Pops up to `max` bytes, waiting until at least one byte is available.
    /// Fails with [io::ErrorKind::UnexpectedEof] once the FIFO is closed and empty.
    ///
    /// Cancel safe: when the returned future is dropped, no byte has been removed.
    pub async fn read(&self, max: usize) -> io::Result<Bytes> {
        loop {
            {
                let mut state = self.state();
                if !state.buffer.is_empty() {
                    let count = max.max(1).min(state.buffer.len());
                    let bytes: Bytes = state.buffer.drain(..count).collect();
                    drop(state);
                    self.writable.notify_one();
                    return Ok(bytes);
                }
                if state.closed {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "FIFO has been closed",
                    ));
                }
            }
            self.readable.notified().await;
        }
    }

    /// Waits until a byte can be read or the FIFO is closed.
    pub async fn wait_readable(&self) {
        loop {
            {
                let state = self.state();
                if !state.buffer.is_empty() || state.closed {
                    return;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Waits until a byte can be pushed or the FIFO is closed.
    pub async fn wait_writable(&self) {
        while !self.is_writable() {
            self.writable.notified().await;
        }
    }

    /// Waits until the FIFO has been closed.
    pub async fn wait_closed(&self) {
        while !self.is_closed() {
            self.readable.notified().await;
        }
    }

    /// Closes the FIFO, waking up both sides.
    pub fn close(&self) {
        self.state().closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Engine side of a FIFO pair.
#[derive(Debug, Clone)]
pub struct EnginePorts {
    /// Command bytes received from the client
    pub commands: Arc<Fifo>,
    /// Sample bytes for the client
    pub samples: Arc<Fifo>,
}

/// Creates a command FIFO and a sample FIFO of the given depth.
pub fn interface(depth: usize) -> (CommandWriter, SampleReader, EnginePorts) {
    let commands = Fifo::new(depth);
    let samples = Fifo::new(depth);
    (
        CommandWriter::new(commands.clone()),
        SampleReader::new(samples.clone()),
        EnginePorts { commands, samples },
    )
}

/// Buffered writer into the command FIFO.
/// Dropping the writer closes the FIFO.
#[derive(Debug)]
pub struct CommandWriter {
    fifo: Arc<Fifo>,
    pending: BytesMut,
}

impl CommandWriter {
    pub fn new(fifo: Arc<Fifo>) -> CommandWriter {
        CommandWriter {
            fifo,
            pending: BytesMut::new(),
        }
    }

    /// Buffers `data`. Nothing reaches the engine until [CommandWriter::flush].
    pub fn write(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Bytes written but not yet flushed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Moves all buffered bytes into the command FIFO, waiting for space as needed.
    ///
    /// Cancel safe: bytes that have not reached the FIFO stay buffered.
    pub async fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            let count = self.fifo.push_slice(&self.pending).await?;
            self.pending.advance(count);
        }
        Ok(())
    }
}

impl Drop for CommandWriter {
    fn drop(&mut self) {
        self.fifo.close();
    }
}

/// Reader of the sample FIFO.
/// Dropping the reader closes the FIFO.
#[derive(Debug)]
pub struct SampleReader {
    fifo: Arc<Fifo>,
    max_chunk: usize,
}

impl SampleReader {
    const DEFAULT_MAX_CHUNK: usize = 4096;

    pub fn new(fifo: Arc<Fifo>) -> SampleReader {
        SampleReader {
            fifo,
            max_chunk: Self::DEFAULT_MAX_CHUNK,
        }
    }

    /// Limits the size of the chunks returned by [SampleReader::read]
    pub fn set_max_chunk(&mut self, max_chunk: usize) {
        self.max_chunk = max_chunk.max(1);
    }

    /// Reads the available sample bytes, waiting until there is at least one.
    pub async fn read(&mut self) -> io::Result<Bytes> {
        self.fifo.read(self.max_chunk).await
    }
}

impl Drop for SampleReader {
    fn drop(&mut self) {
        self.fifo.close();
    }
}
