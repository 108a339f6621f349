//! Forwarding between a network stream and the engine FIFOs.
//!
//! The [Bridge] runs two loops for the lifetime of a session:
//!
//! - **outbound**: receive a chunk from the network, write it to the [CommandWriter] and flush
//! - **inbound**: read a chunk of samples from the [SampleReader] and send it to the network
//!
//! A chunk that has been received is always delivered in full before a loop stops, unless
//! the whole session is cancelled. When the client closes its side, every sample the engine
//! still produces is delivered. Otherwise, when one loop finishes, the other one stops at
//! its next receive point.
use std::{error::Error, fmt::Display, io, sync::Arc};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Notify,
};
use tokio_util::sync::CancellationToken;

use crate::fifo::{CommandWriter, SampleReader};

/// What an interrupt delivered to a single loop does.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum InterruptPolicy {
    /// Log the interrupt and keep forwarding
    #[default]
    Absorb,
    /// End the session with [BridgeError::Interrupted]
    EndSession,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Largest chunk received from the network or sent to it at once
    pub chunk_size: usize,
    pub interrupt_policy: InterruptPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            interrupt_policy: InterruptPolicy::Absorb,
        }
    }
}

/// One of the two forwarding loops
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Leg {
    /// Network to engine
    Outbound,
    /// Engine to network
    Inbound,
}

impl Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Outbound => write!(f, "outbound"),
            Leg::Inbound => write!(f, "inbound"),
        }
    }
}

/// How a session ended without error
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEnd {
    /// The client closed the connection
    PeerClosed,
    /// The session was cancelled from outside
    Cancelled,
}

impl Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "client closed the connection"),
            SessionEnd::Cancelled => write!(f, "session cancelled"),
        }
    }
}

#[derive(Debug)]
pub enum BridgeError {
    Io { leg: Leg, error: io::Error },
    /// An interrupt ended the session, see [InterruptPolicy::EndSession]
    Interrupted(Leg),
}

impl BridgeError {
    fn io(leg: Leg) -> impl FnOnce(io::Error) -> BridgeError {
        move |error| BridgeError::Io { leg, error }
    }

    /// Whether the error means that the client is gone
    fn is_disconnect(&self) -> bool {
        match self {
            BridgeError::Io { error, .. } => matches!(
                error.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            BridgeError::Interrupted(_) => false,
        }
    }

    pub fn leg(&self) -> Leg {
        match self {
            BridgeError::Io { leg, .. } | BridgeError::Interrupted(leg) => *leg,
        }
    }
}

impl Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Io { leg, error } => write!(f, "I/O error on {} leg: {}", leg, error),
            BridgeError::Interrupted(leg) => write!(f, "Interrupted {} leg", leg),
        }
    }
}

impl Error for BridgeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BridgeError::Io { error, .. } => Some(error),
            BridgeError::Interrupted(_) => None,
        }
    }
}

/// Delivers interrupts to the individual loops of a running [Bridge].
///
/// An interrupt is observed at the next point where the loop waits for a new chunk.
/// What happens then is decided by the [InterruptPolicy].
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    outbound: Arc<Notify>,
    inbound: Arc<Notify>,
}

impl Interrupts {
    pub fn interrupt(&self, leg: Leg) {
        match leg {
            Leg::Outbound => self.outbound.notify_one(),
            Leg::Inbound => self.inbound.notify_one(),
        }
    }

    fn notify(&self, leg: Leg) -> &Notify {
        match leg {
            Leg::Outbound => &self.outbound,
            Leg::Inbound => &self.inbound,
        }
    }
}

/// Result of a single loop. `Ok(None)` means the loop was told to stop by the bridge.
type LoopResult = Result<Option<SessionEnd>, BridgeError>;

#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    interrupts: Interrupts,
    cancel: CancellationToken,
}

impl Bridge {
    /// Creates a bridge. Cancelling `cancel` ends the session.
    pub fn new(config: BridgeConfig, cancel: CancellationToken) -> Bridge {
        Bridge::with_interrupts(config, cancel, Interrupts::default())
    }

    pub fn with_interrupts(
        config: BridgeConfig,
        cancel: CancellationToken,
        interrupts: Interrupts,
    ) -> Bridge {
        Bridge {
            config,
            interrupts,
            cancel,
        }
    }

    pub fn interrupts(&self) -> Interrupts {
        self.interrupts.clone()
    }

    /// Forwards between `stream` and the engine FIFOs until the session ends.
    ///
    /// When the client closes its sending side, the command FIFO is closed and the
    /// inbound loop keeps delivering samples until the sample FIFO is closed and empty.
    /// Any other end of a loop stops the other loop at its next receive point.
    ///
    /// The first loop to finish determines the outcome. Errors take precedence over
    /// a regular end reported by the other loop.
    pub async fn run<S>(
        &self,
        stream: S,
        commands: CommandWriter,
        mut samples: SampleReader,
    ) -> Result<SessionEnd, BridgeError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut network_rx, mut network_tx) = tokio::io::split(stream);
        samples.set_max_chunk(self.config.chunk_size);
        let stop = self.cancel.child_token();

        let outbound = self.forward_out(&mut network_rx, commands, &stop);
        let inbound = self.forward_in(&mut samples, &mut network_tx, &stop);
        tokio::pin!(outbound, inbound);

        let (first, finished) = tokio::select! {
            result = &mut outbound => (result, Leg::Outbound),
            result = &mut inbound => (result, Leg::Inbound),
        };
        let draining =
            finished == Leg::Outbound && matches!(first, Ok(Some(SessionEnd::PeerClosed)));
        if draining {
            log::debug!("Client finished sending, delivering remaining samples");
        } else {
            log::debug!("{} leg finished, stopping the other leg", finished);
            stop.cancel();
        }
        let second = match finished {
            Leg::Outbound => inbound.await,
            Leg::Inbound => outbound.await,
        };

        match (first, second) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) if draining && err.is_disconnect() => {
                log::debug!("Client went away, dropping undelivered samples: {}", err);
                Ok(SessionEnd::PeerClosed)
            }
            (Ok(_), Err(err)) => Err(err),
            // A cancellation while draining outranks the client having closed
            (Ok(end), Ok(other)) if draining => {
                Ok(other.or(end).unwrap_or(SessionEnd::PeerClosed))
            }
            (Ok(end), Ok(other)) => Ok(end.or(other).unwrap_or(SessionEnd::PeerClosed)),
        }
    }

    fn stopped(&self) -> Option<SessionEnd> {
        self.cancel.is_cancelled().then_some(SessionEnd::Cancelled)
    }

    fn on_interrupt(&self, leg: Leg) -> Result<(), BridgeError> {
        match self.config.interrupt_policy {
            InterruptPolicy::Absorb => {
                log::debug!("Ignoring interrupt on {} leg", leg);
                Ok(())
            }
            InterruptPolicy::EndSession => {
                log::info!("Interrupt on {} leg ends the session", leg);
                Err(BridgeError::Interrupted(leg))
            }
        }
    }

    /// Owns the [CommandWriter], so the command FIFO is closed once this loop ends.
    async fn forward_out<R>(
        &self,
        network: &mut R,
        mut commands: CommandWriter,
        stop: &CancellationToken,
    ) -> LoopResult
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.config.chunk_size);
        loop {
            buf.clear();
            let mut chunk = (&mut *network).take(self.config.chunk_size as u64);
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(self.stopped()),
                _ = self.interrupts.notify(Leg::Outbound).notified() => {
                    self.on_interrupt(Leg::Outbound)?;
                    continue;
                }
                result = chunk.read_buf(&mut buf) => result.map_err(BridgeError::io(Leg::Outbound))?,
            };
            if received == 0 {
                log::debug!("Client closed the connection");
                return Ok(Some(SessionEnd::PeerClosed));
            }
            log::trace!("Forwarding {} command bytes", received);

            commands.write(&buf);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Some(SessionEnd::Cancelled)),
                result = commands.flush() => result.map_err(BridgeError::io(Leg::Outbound))?,
            }
        }
    }

    async fn forward_in<W>(
        &self,
        samples: &mut SampleReader,
        network: &mut W,
        stop: &CancellationToken,
    ) -> LoopResult
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let data = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(self.stopped()),
                _ = self.interrupts.notify(Leg::Inbound).notified() => {
                    self.on_interrupt(Leg::Inbound)?;
                    continue;
                }
                result = samples.read() => match result {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        log::debug!("Engine finished, no more samples");
                        return Ok(None);
                    }
                    Err(e) => return Err(BridgeError::io(Leg::Inbound)(e)),
                },
            };
            log::trace!("Forwarding {} sample bytes", data.len());

            let send = async {
                network.write_all(&data).await?;
                network.flush().await
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Some(SessionEnd::Cancelled)),
                result = send => result.map_err(BridgeError::io(Leg::Inbound))?,
            }
        }
    }
}
