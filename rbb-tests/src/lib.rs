//! Helpers shared by the integration tests.
use std::io;

use bytes::{BufMut, BytesMut};
use rbb_protocol::Command;
use rbb_server::{
    Capabilities,
    endpoint::{Endpoint, Listener},
    server::Builder,
    sim::LoopbackBus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A server on a loopback bus, serving in a background task
pub struct TestServer {
    endpoint: Endpoint,
    shutdown: CancellationToken,
    handle: JoinHandle<LoopbackBus>,
}

impl TestServer {
    /// Starts a server on a free port of 127.0.0.1.
    pub async fn start(builder: Builder, capabilities: Capabilities) -> io::Result<TestServer> {
        let endpoint = "tcp:127.0.0.1:0".parse().map_err(io::Error::other)?;
        TestServer::start_on(&endpoint, builder, capabilities).await
    }

    pub async fn start_on(
        endpoint: &Endpoint,
        builder: Builder,
        capabilities: Capabilities,
    ) -> io::Result<TestServer> {
        let listener = Listener::bind(endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        let mut server = builder
            .build(LoopbackBus::new(capabilities))
            .map_err(io::Error::other)?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                server.serve(listener, shutdown).await;
                server.into_bus()
            }
        });
        Ok(TestServer {
            endpoint,
            shutdown,
            handle,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `HOST:PORT` of a TCP server
    pub fn addr(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => format!("{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => path.display().to_string(),
        }
    }

    /// Stops the server and returns the bus for inspection.
    pub async fn stop(self) -> LoopbackBus {
        self.shutdown.cancel();
        match self.handle.await {
            Ok(bus) => bus,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

/// Commands clocking one bit per entry through the chain with TMS low,
/// sampling TDO before every rising edge.
pub fn shift_commands(tdi: &[bool]) -> Vec<Command> {
    tdi.iter()
        .flat_map(|&tdi| {
            [
                Command::Write {
                    tck: false,
                    tms: false,
                    tdi,
                },
                Command::Sample,
                Command::Write {
                    tck: true,
                    tms: false,
                    tdi,
                },
            ]
        })
        .collect()
}

/// Raw command bytes of `commands`
pub fn encode(commands: &[Command]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(commands.len());
    for command in commands {
        buf.put_u8(command.to_byte());
    }
    buf
}

/// Expected loopback output for `tdi`: every bit delayed by one, starting low.
pub fn delayed_by_one(tdi: &[bool]) -> Vec<bool> {
    std::iter::once(false)
        .chain(tdi.iter().copied())
        .take(tdi.len())
        .collect()
}
