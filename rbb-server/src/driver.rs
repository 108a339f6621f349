//! Real-time driver for the [Engine].
//!
//! The driver keeps a virtual clock running at the tick rate. Elapsed ticks are
//! accumulated, and the driver only sleeps once the virtual clock is ahead of the
//! wall clock by at least [MIN_SLEEP]. Short TCK periods are therefore paid in bursts,
//! while the long-run pacing stays exact.
//!
//! Delays and reset transitions are not paid in bursts: after a sleep or reset command,
//! the next command that touches the bus waits until its deadline has passed, however
//! short the remaining time is. Commands may run late, but never before their deadline.
use std::time::Duration;

use rbb_protocol::Command;
use tokio::time::{Instant, sleep_until};

use crate::{
    SignalBus,
    engine::{Engine, Tick, Timing},
    fifo::EnginePorts,
};

/// Shortest sleep the driver performs between regular commands
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Commands executed between cooperative yields
const YIELD_INTERVAL: u32 = 4096;

#[derive(Debug)]
struct Pacer {
    tick_rate_hz: u64,
    origin: Instant,
    ticks: u64,
    /// Set after a delay or reset. The next command on the bus waits for its exact deadline.
    exact: bool,
}

impl Pacer {
    fn new(tick_rate_hz: u64) -> Pacer {
        Pacer {
            tick_rate_hz: tick_rate_hz.max(1),
            origin: Instant::now(),
            ticks: 0,
            exact: false,
        }
    }

    /// Restarts the virtual clock at the current time, keeping a pending deadline.
    fn resync(&mut self) {
        self.origin = Instant::now().max(self.deadline());
        self.ticks = 0;
    }

    fn advance(&mut self, ticks: u32) {
        self.ticks += u64::from(ticks);
    }

    fn deadline(&self) -> Instant {
        let nanos = u128::from(self.ticks) * 1_000_000_000 / u128::from(self.tick_rate_hz);
        self.origin + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Sleeps until the wall clock has caught up with the virtual clock,
    /// unless the difference is below [MIN_SLEEP].
    async fn catch_up(&self) {
        let deadline = self.deadline();
        if deadline.saturating_duration_since(Instant::now()) >= MIN_SLEEP {
            sleep_until(deadline).await;
        }
    }

    /// Sleeps until the virtual clock's deadline has passed.
    async fn settle(&mut self) {
        self.exact = false;
        let deadline = self.deadline();
        if deadline > Instant::now() {
            sleep_until(deadline).await;
        }
    }
}

/// Whether executing `byte` has an effect on the bus
fn touches_bus(byte: u8) -> bool {
    !matches!(
        Command::from_byte(byte),
        Ok(Command::SleepMillis | Command::SleepMicros | Command::Quit)
    )
}

/// Runs an [Engine] against a pair of FIFOs.
#[derive(Debug)]
pub struct Driver<B: SignalBus> {
    engine: Engine<B>,
    ports: EnginePorts,
    pacer: Pacer,
    halted: Option<u8>,
}

impl<B: SignalBus> Driver<B> {
    pub fn new(bus: B, timing: Timing, tick_rate_hz: u64, ports: EnginePorts) -> Driver<B> {
        Driver {
            engine: Engine::new(bus, timing),
            ports,
            pacer: Pacer::new(tick_rate_hz),
            halted: None,
        }
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    /// The byte that stalled the engine, if any
    pub fn halted(&self) -> Option<u8> {
        self.halted
    }

    pub fn into_engine(self) -> Engine<B> {
        self.engine
    }

    /// Executes commands until the command FIFO is closed and drained.
    /// The sample FIFO is closed when this returns.
    ///
    /// A byte outside the command vocabulary stalls the engine. In that case the
    /// driver consumes nothing more and only returns once the command FIFO is closed.
    pub async fn run(&mut self) {
        self.execute().await;
        self.ports.samples.close();
    }

    async fn execute(&mut self) {
        self.pacer.resync();
        let mut budget = YIELD_INTERVAL;
        loop {
            let remaining = self.engine.timer();
            if remaining > 0 {
                let skipped = self.engine.fast_forward(remaining);
                self.pacer.advance(skipped);
                self.pacer.catch_up().await;
                continue;
            }

            let input = self.ports.commands.peek();
            if self.pacer.exact && input.is_some_and(touches_bus) {
                self.pacer.settle().await;
            }
            let tick = self.engine.tick(input, self.ports.samples.is_writable());
            match tick {
                // The timer has been drained above
                Tick::Waiting => self.pacer.advance(1),
                Tick::Executed(command) => {
                    self.ports.commands.pop();
                    let timed = matches!(
                        command,
                        Command::SleepMillis | Command::SleepMicros | Command::Reset { .. }
                    );
                    if timed && !self.pacer.exact {
                        // Count the delay from the bus change it follows, even if that ran late
                        self.pacer.resync();
                        self.pacer.exact = true;
                    }
                    self.pacer.advance(1);
                    log::trace!("Executed {}", command);
                    if command == Command::Quit {
                        log::debug!("Client announced disconnect");
                    }
                }
                Tick::Sampled(byte) => {
                    self.ports.commands.pop();
                    self.ports.samples.push(byte);
                    self.pacer.advance(1);
                    log::trace!("Sampled TDO={}", char::from(byte));
                }
                Tick::Idle => {
                    if self.ports.commands.is_closed() {
                        // The last delay still belongs to the session
                        self.pacer.settle().await;
                        log::debug!("Command FIFO closed, stopping engine");
                        return;
                    }
                    self.ports.commands.wait_readable().await;
                    self.pacer.resync();
                    continue;
                }
                Tick::Backpressure => {
                    log::trace!("Sample FIFO full, waiting");
                    self.ports.samples.wait_writable().await;
                    self.pacer.resync();
                    continue;
                }
                Tick::Halted(byte) => {
                    log::warn!(
                        "Unknown command byte 0x{:02x}, engine halted for the rest of the session",
                        byte
                    );
                    self.halted = Some(byte);
                    self.ports.commands.wait_closed().await;
                    return;
                }
            }

            budget -= 1;
            if budget == 0 {
                budget = YIELD_INTERVAL;
                tokio::task::yield_now().await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::Driver;
    use crate::{
        Capabilities, SignalBus, Signals, engine::Timing, fifo::interface, sim::LoopbackBus,
    };

    const TICK_RATE: u64 = 1_000_000;

    fn timing() -> Timing {
        // 10 kHz TCK at 1 MHz ticks
        Timing::from_frequency(TICK_RATE, 10).unwrap()
    }

    #[tokio::test]
    async fn executes_commands_until_closed() {
        let (mut writer, mut reader, ports) = interface(64);
        let mut driver = Driver::new(
            LoopbackBus::new(Capabilities::full()),
            timing(),
            TICK_RATE,
            ports,
        );

        writer.write(b"u15R6R0Br");
        let client = async {
            writer.flush().await.unwrap();
            let mut samples = Vec::new();
            while samples.len() < 2 {
                samples.extend_from_slice(&reader.read().await.unwrap());
            }
            drop(writer);
            samples
        };
        let ((), samples) = tokio::join!(driver.run(), client);
        // '5' raises TCK with TDI high, '6' keeps TCK high so nothing is recaptured
        assert_eq!(samples, b"11".to_vec());

        let engine = driver.engine();
        assert!(engine.blink());
        let bus = engine.bus();
        assert_eq!(bus.rising_edges(), 1);
        assert!(!bus.signals().trst);
        assert!(!bus.signals().srst);
        assert_eq!(driver.halted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_write_commands() {
        let (mut writer, _reader, ports) = interface(4096);
        let mut driver = Driver::new(
            LoopbackBus::new(Capabilities::default()),
            timing(),
            TICK_RATE,
            ports,
        );

        // 1000 writes at 100 ticks each take 100 ms
        let stream: Vec<u8> = (0..1000).map(|i| if i % 2 == 0 { b'0' } else { b'4' }).collect();
        writer.write(&stream);
        writer.flush().await.unwrap();
        drop(writer);

        let start = Instant::now();
        driver.run().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(99), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(101), "{:?}", elapsed);
        assert_eq!(driver.engine().bus().rising_edges(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn long_sleep_takes_a_millisecond() {
        let (mut writer, _reader, ports) = interface(4096);
        let mut driver = Driver::new(
            LoopbackBus::new(Capabilities::default()),
            timing(),
            TICK_RATE,
            ports,
        );

        writer.write(&[b'Z'; 20]);
        writer.flush().await.unwrap();
        drop(writer);

        let start = Instant::now();
        driver.run().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(21), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn unknown_command_stalls_until_closed() {
        let (mut writer, mut reader, ports) = interface(64);
        let mut driver = Driver::new(
            LoopbackBus::new(Capabilities::default()),
            timing(),
            TICK_RATE,
            ports.clone(),
        );

        writer.write(b"RXR");
        let client = async {
            writer.flush().await.unwrap();
            let first = reader.read().await.unwrap();
            // Leave the driver some time to (not) answer the second sample
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(ports.samples.len(), 0);
            assert_eq!(ports.commands.len(), 2);
            drop(writer);
            first
        };
        let ((), first) = tokio::join!(driver.run(), client);
        assert_eq!(&first[..], b"0");
        assert_eq!(driver.halted(), Some(b'X'));
    }

    #[tokio::test]
    async fn sample_backpressure_preserves_order() {
        let (mut writer, mut reader, ports) = interface(1);
        let mut driver = Driver::new(
            LoopbackBus::new(Capabilities::default()),
            timing(),
            TICK_RATE,
            ports,
        );

        // tdi pattern 1,0,1,1 captured on each rising edge and sampled afterwards
        let mut stream = Vec::new();
        for tdi in [true, false, true, true] {
            let low = if tdi { b'1' } else { b'0' };
            stream.extend_from_slice(&[low, low | 0b100, b'R']);
        }
        writer.write(&stream);
        let client = async {
            writer.flush().await.unwrap();
            let mut samples = Vec::new();
            while samples.len() < 4 {
                // Reading slowly keeps the single entry sample FIFO full
                tokio::time::sleep(Duration::from_millis(2)).await;
                samples.extend_from_slice(&reader.read().await.unwrap());
            }
            drop(writer);
            samples
        };
        let ((), samples) = tokio::join!(driver.run(), client);
        assert_eq!(samples, b"1011".to_vec());
    }

    /// Records when TRST changes
    #[derive(Default)]
    struct TimedBus {
        trst: Vec<(Instant, bool)>,
    }

    impl TimedBus {
        fn pulse(&self) -> Duration {
            assert_eq!(self.trst.len(), 3, "{:?}", self.trst);
            self.trst[2].0 - self.trst[1].0
        }
    }

    impl SignalBus for TimedBus {
        fn capabilities(&self) -> Capabilities {
            Capabilities::full()
        }

        fn drive(&mut self, signals: Signals) {
            if self.trst.last().map(|(_, level)| *level) != Some(signals.trst) {
                self.trst.push((Instant::now(), signals.trst));
            }
        }

        fn sample_tdo(&mut self) -> bool {
            false
        }

        fn set_indicator(&mut self, _on: bool) {}
    }

    #[tokio::test(start_paused = true)]
    async fn short_delays_are_not_skipped() {
        let (mut writer, mut reader, ports) = interface(4096);
        let tick_rate = 48_000_000;
        let mut driver = Driver::new(
            TimedBus::default(),
            Timing::from_frequency(tick_rate, 100).unwrap(),
            tick_rate,
            ports,
        );

        let mut stream = vec![b't'];
        stream.extend_from_slice(&[b'z'; 500]);
        stream.push(b'r');
        writer.write(&stream);
        writer.flush().await.unwrap();
        drop(writer);

        driver.run().await;
        let pulse = driver.engine().bus().pulse();
        assert!(pulse >= Duration::from_micros(500), "{:?}", pulse);
        // The sample FIFO is closed once the driver is done
        assert!(reader.read().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_delay_survives_idle_wait() {
        let (mut writer, _reader, ports) = interface(4096);
        let mut driver = Driver::new(TimedBus::default(), timing(), TICK_RATE, ports);

        let client = async {
            writer.write(b"t");
            writer.write(&[b'z'; 300]);
            writer.flush().await.unwrap();
            // Let the driver run dry before the pulse ends
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            writer.write(b"r");
            writer.flush().await.unwrap();
            drop(writer);
        };
        tokio::join!(driver.run(), client);
        let pulse = driver.engine().bus().pulse();
        assert!(pulse >= Duration::from_micros(300), "{:?}", pulse);
    }
}
