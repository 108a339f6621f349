use std::error::Error;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    SignalBus,
    bridge::{Bridge, BridgeConfig, BridgeError, InterruptPolicy, Interrupts, SessionEnd},
    driver::Driver,
    endpoint::{Endpoint, Listener},
    engine::{Timing, TimingError},
    fifo,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Rate of the engine's virtual clock
    pub tick_rate_hz: u64,
    /// TCK frequency
    pub frequency_khz: u32,
    /// Depth of the command and the sample FIFO
    pub fifo_depth: usize,
    pub bridge: BridgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_rate_hz: 48_000_000,
            frequency_khz: 100,
            fifo_depth: 512,
            bridge: BridgeConfig::default(),
        }
    }
}

impl Config {
    pub fn timing(&self) -> Result<Timing, TimingError> {
        Timing::from_frequency(self.tick_rate_hz, self.frequency_khz)
    }
}

#[derive(Debug)]
pub struct Server<B: SignalBus> {
    bus: B,
    config: Config,
    timing: Timing,
    interrupts: Interrupts,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use rbb_server::server::Builder;
///
/// let server = Builder::new()
///     .frequency_khz(1000)
///     .fifo_depth(1024)
///     .build(my_bus)?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the TCK frequency in kHz
    pub fn frequency_khz(mut self, frequency_khz: u32) -> Self {
        self.config.frequency_khz = frequency_khz;
        self
    }

    /// Set the rate of the engine clock that all delays are counted in
    pub fn tick_rate_hz(mut self, tick_rate_hz: u64) -> Self {
        self.config.tick_rate_hz = tick_rate_hz;
        self
    }

    /// Set the depth of the command and sample FIFOs
    pub fn fifo_depth(mut self, depth: usize) -> Self {
        self.config.fifo_depth = depth;
        self
    }

    /// Set the largest chunk forwarded at once
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.bridge.chunk_size = size;
        self
    }

    /// Set whether interrupting a forwarding loop ends the session
    pub fn interrupt_policy(mut self, policy: InterruptPolicy) -> Self {
        self.config.bridge.interrupt_policy = policy;
        self
    }

    /// Build and return the server
    pub fn build<B: SignalBus>(self, bus: B) -> Result<Server<B>, TimingError> {
        Server::new(bus, self.config)
    }
}

impl<B: SignalBus> Server<B> {
    pub fn new(bus: B, config: Config) -> Result<Server<B>, TimingError> {
        let timing = config.timing()?;
        log::debug!(
            "Timing: period_cyc={}, us_cyc={} at {} Hz",
            timing.period_cyc(),
            timing.us_cyc(),
            config.tick_rate_hz
        );
        Ok(Server {
            bus,
            config,
            timing,
            interrupts: Interrupts::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Interrupts for the forwarding loops of the running session
    pub fn interrupts(&self) -> Interrupts {
        self.interrupts.clone()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Binds `endpoint` and serves clients until `shutdown` is cancelled.
    pub async fn listen(
        &mut self,
        endpoint: &Endpoint,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn Error>> {
        let listener = Listener::bind(endpoint).await?;
        log::info!("Server listening on {}", listener.local_endpoint()?);
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serves one client after the other until `shutdown` is cancelled.
    pub async fn serve(&mut self, listener: Listener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((connection, peer)) => {
                    log::info!("New client connection from {}", peer);
                    match self.run_session(connection, shutdown.child_token()).await {
                        Ok(end) => log::info!("Session with {} ended: {}", peer, end),
                        Err(e) => log::error!("Session with {} failed: {}", peer, e),
                    }
                }
                Err(e) => log::error!("Connection error: {}", e),
            }
        }
        log::info!("Server shutting down");
    }

    /// Runs a single session on an established stream.
    ///
    /// The engine starts from idle signal levels. When the client closes the
    /// connection, the engine still executes every command it has received. On
    /// cancellation or an error, pending commands are discarded. The bus is free
    /// again when this returns.
    pub async fn run_session<S>(
        &mut self,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, BridgeError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (commands, samples, ports) = fifo::interface(self.config.fifo_depth);
        let mut driver = Driver::new(&mut self.bus, self.timing, self.config.tick_rate_hz, ports);
        let bridge = Bridge::with_interrupts(
            self.config.bridge.clone(),
            cancel.clone(),
            self.interrupts.clone(),
        );
        let abort = cancel.child_token();

        let forward = async {
            let result = bridge.run(stream, commands, samples).await;
            if !matches!(result, Ok(SessionEnd::PeerClosed)) {
                abort.cancel();
            }
            result
        };
        let execute = async {
            tokio::select! {
                biased;
                _ = abort.cancelled() => log::debug!("Discarding pending commands"),
                () = driver.run() => {}
            }
        };
        let (result, ()) = tokio::join!(forward, execute);

        if let Some(byte) = driver.halted() {
            log::warn!("Session ended with the engine halted on byte 0x{:02x}", byte);
        }
        result
    }
}
