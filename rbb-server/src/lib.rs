//! # Remote Bitbang Server Library
//!
//! This crate bridges clients speaking the OpenOCD remote bitbang protocol to a JTAG signal bus.
//!
//! ## Overview
//!
//! OpenOCD can drive a JTAG bus signal by signal over a socket. Every byte it sends is one
//! command (see [`rbb_protocol`]) that sets TCK, TMS and TDI, sets the reset pair, samples TDO,
//! or delays the next command. This library executes these commands against a backend device
//! with calibrated timing.
//!
//! ## Architecture
//!
//! The crate is built from the following components:
//!
//! - **[`SignalBus`] Trait**: Defines the interface that backends must implement to drive
//!   and sample the physical or simulated JTAG lines
//! - **[`engine::Engine`]**: A tick driven state machine that decodes one command byte per tick
//!   and owns the pacing timer
//! - **[`driver::Driver`]**: Advances the engine in real time and moves bytes between the
//!   engine and its FIFOs
//! - **[`fifo`]**: The bounded command and sample FIFOs connecting the engine to the network
//! - **[`bridge::Bridge`]**: Two forwarding loops relaying bytes between a network stream and
//!   the FIFOs
//! - **[`server::Server`]**: Accepts connections on an [`endpoint::Endpoint`] and runs one
//!   session at a time
//!
//! ## Basic Usage
//!
//! ### Implementing a Backend
//!
//! ```ignore
//! use rbb_server::{Capabilities, SignalBus, Signals};
//!
//! struct MyBus {
//!     // device-specific fields
//! }
//!
//! impl SignalBus for MyBus {
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::default()
//!     }
//!
//!     fn drive(&mut self, signals: Signals) {
//!         // Set TCK, TMS, TDI and, when present, nTRST and nSRST
//!     }
//!
//!     fn sample_tdo(&mut self) -> bool {
//!         false
//!     }
//!
//!     fn set_indicator(&mut self, _on: bool) {}
//! }
//! ```
//!
//! ### Starting the Server
//!
//! ```ignore
//! use rbb_server::server::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut server = Server::new(MyBus::new()?, Config::default())?;
//! server.listen(&"tcp:127.0.0.1:2222".parse()?, CancellationToken::new()).await?;
//! ```
//!
//! ## Error Handling
//!
//! The remote bitbang protocol has no error reporting. A byte outside the command vocabulary
//! stalls the engine, which stops consuming commands for the rest of the session. Transport
//! errors end the session and are reported as [`bridge::BridgeError`].
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Enable logging to see:
//! - Client connections and disconnections
//! - Session configuration and timing
//! - Individual commands and forwarded chunks (at `trace` level)
//!
//! ## Thread Model
//!
//! Each session runs in a single task. The engine driver and both forwarding loops are
//! multiplexed in that task, so the bus is never shared between threads.
pub mod bridge;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod fifo;
pub mod server;
pub mod sim;

/// Levels of the driven JTAG lines.
///
/// `trst` and `srst` are assertion levels. Backends translate them to the
/// active-low nTRST and nSRST pins.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Signals {
    pub tck: bool,
    pub tms: bool,
    pub tdi: bool,
    pub trst: bool,
    pub srst: bool,
}

/// Optional lines a backend provides.
/// TCK, TMS, TDI and TDO are always present.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub has_trst: bool,
    pub has_srst: bool,
    pub has_indicator: bool,
}

impl Capabilities {
    /// All optional lines present
    pub fn full() -> Capabilities {
        Capabilities {
            has_trst: true,
            has_srst: true,
            has_indicator: true,
        }
    }
}

/// Trait that backends must implement to provide access to the JTAG lines.
///
/// Implementations hold no protocol logic, only the signal registers. Lines that
/// [`SignalBus::capabilities`] reports as absent are silently not driven.
pub trait SignalBus {
    /// The optional lines this backend drives
    fn capabilities(&self) -> Capabilities;

    /// Drive all output lines to the given levels.
    /// Both reset lines are actively driven; there is no tri-state in this profile.
    fn drive(&mut self, signals: Signals);

    /// Sample the current TDO level.
    fn sample_tdo(&mut self) -> bool;

    /// Switch the activity indicator, if present.
    fn set_indicator(&mut self, on: bool);
}

impl<T: SignalBus + ?Sized> SignalBus for &mut T {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn drive(&mut self, signals: Signals) {
        (**self).drive(signals)
    }

    fn sample_tdo(&mut self) -> bool {
        (**self).sample_tdo()
    }

    fn set_indicator(&mut self, on: bool) {
        (**self).set_indicator(on)
    }
}
