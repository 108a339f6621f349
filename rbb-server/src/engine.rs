//! Tick driven command engine.
//!
//! The engine decodes at most one command byte per tick. After a write command it waits
//! `period_cyc` ticks before accepting the next one, which emulates the configured TCK
//! frequency. The sleep commands wait `1000 * us_cyc` and `us_cyc` ticks.
use std::{error::Error, fmt::Display};

use rbb_protocol::{Command, encode_sample};

use crate::{Capabilities, SignalBus, Signals};

/// Tick counts for one TCK half period and for one microsecond.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    period_cyc: u32,
    us_cyc: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimingError {
    ZeroFrequency,
    /// The tick rate is too low to resolve the requested frequency
    FrequencyTooHigh { tick_rate_hz: u64, frequency_khz: u32 },
    /// The tick rate is too low to resolve a microsecond
    TickRateTooLow(u64),
    /// The tick counts do not fit the timer
    OutOfRange,
}

impl Display for TimingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimingError::ZeroFrequency => write!(f, "TCK frequency must not be zero"),
            TimingError::FrequencyTooHigh {
                tick_rate_hz,
                frequency_khz,
            } => write!(
                f,
                "TCK frequency {} kHz is too high for a tick rate of {} Hz",
                frequency_khz, tick_rate_hz
            ),
            TimingError::TickRateTooLow(rate) => {
                write!(f, "Tick rate {} Hz is below 1 MHz", rate)
            }
            TimingError::OutOfRange => write!(f, "Tick counts exceed the timer range"),
        }
    }
}

impl Error for TimingError {}

impl Timing {
    pub fn new(period_cyc: u32, us_cyc: u32) -> Result<Timing, TimingError> {
        if period_cyc == 0 || us_cyc == 0 {
            return Err(TimingError::OutOfRange);
        }
        us_cyc.checked_mul(1000).ok_or(TimingError::OutOfRange)?;
        Ok(Timing { period_cyc, us_cyc })
    }

    /// Derives the tick counts from the tick rate of the engine and the TCK frequency.
    pub fn from_frequency(tick_rate_hz: u64, frequency_khz: u32) -> Result<Timing, TimingError> {
        if frequency_khz == 0 {
            return Err(TimingError::ZeroFrequency);
        }
        let period_cyc = tick_rate_hz / (u64::from(frequency_khz) * 1000);
        if period_cyc == 0 {
            return Err(TimingError::FrequencyTooHigh {
                tick_rate_hz,
                frequency_khz,
            });
        }
        let us_cyc = tick_rate_hz / 1_000_000;
        if us_cyc == 0 {
            return Err(TimingError::TickRateTooLow(tick_rate_hz));
        }
        Timing::new(
            u32::try_from(period_cyc).map_err(|_| TimingError::OutOfRange)?,
            u32::try_from(us_cyc).map_err(|_| TimingError::OutOfRange)?,
        )
    }

    pub fn period_cyc(&self) -> u32 {
        self.period_cyc
    }

    pub fn us_cyc(&self) -> u32 {
        self.us_cyc
    }

    /// The exclusive upper bound of the timer
    pub fn timer_limit(&self) -> u32 {
        self.period_cyc.max(1000 * self.us_cyc)
    }
}

/// Outcome of a single engine tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tick {
    /// The timer was running and has been decremented.
    Waiting,
    /// No command byte was available.
    Idle,
    /// A command was consumed.
    Executed(Command),
    /// A sample command was consumed and produced this response byte.
    Sampled(u8),
    /// A sample command is pending but the output cannot accept a byte.
    /// The command has not been consumed.
    Backpressure,
    /// The byte is not a command. It has not been consumed and the engine
    /// will not make progress on this input.
    Halted(u8),
}

impl Tick {
    /// Whether the input byte was consumed
    pub fn consumed(&self) -> bool {
        matches!(self, Tick::Executed(_) | Tick::Sampled(_))
    }

    /// The byte produced by this tick
    pub fn output(&self) -> Option<u8> {
        match self {
            Tick::Sampled(byte) => Some(*byte),
            _ => None,
        }
    }
}

/// The command engine, owning the signal state and the timer.
#[derive(Debug)]
pub struct Engine<B: SignalBus> {
    bus: B,
    timing: Timing,
    timer: u32,
    signals: Signals,
    blink: bool,
}

impl<B: SignalBus> Engine<B> {
    /// Creates an engine and drives the idle levels: all lines low, resets deasserted.
    pub fn new(mut bus: B, timing: Timing) -> Engine<B> {
        let signals = Signals::default();
        bus.drive(signals);
        bus.set_indicator(false);
        Engine {
            bus,
            timing,
            timer: 0,
            signals,
            blink: false,
        }
    }

    /// Advances the engine by one tick.
    ///
    /// `input` is the byte at the head of the command stream, if any.
    /// `output_ready` tells whether a response byte can be accepted.
    pub fn tick(&mut self, input: Option<u8>, output_ready: bool) -> Tick {
        if self.timer != 0 {
            self.timer -= 1;
            return Tick::Waiting;
        }
        let Some(byte) = input else {
            return Tick::Idle;
        };
        let Ok(command) = Command::from_byte(byte) else {
            return Tick::Halted(byte);
        };
        match command {
            Command::Write { tck, tms, tdi } => {
                self.signals.tck = tck;
                self.signals.tms = tms;
                self.signals.tdi = tdi;
                self.bus.drive(self.signals);
                self.timer = self.timing.period_cyc - 1;
            }
            Command::Reset { trst, srst } => {
                self.signals.trst = trst;
                self.signals.srst = srst;
                self.bus.drive(self.signals);
            }
            Command::Sample => {
                if !output_ready {
                    return Tick::Backpressure;
                }
                return Tick::Sampled(encode_sample(self.bus.sample_tdo()));
            }
            Command::Blink(on) => {
                self.blink = on;
                self.bus.set_indicator(on);
            }
            Command::SleepMillis => self.timer = 1000 * self.timing.us_cyc - 1,
            Command::SleepMicros => self.timer = self.timing.us_cyc - 1,
            Command::Quit => {}
        }
        Tick::Executed(command)
    }

    /// Performs up to `ticks` waiting ticks at once.
    /// Returns the number of ticks the timer was decremented by.
    pub fn fast_forward(&mut self, ticks: u32) -> u32 {
        let skipped = ticks.min(self.timer);
        self.timer -= skipped;
        skipped
    }

    /// Remaining ticks before the next command is accepted
    pub fn timer(&self) -> u32 {
        self.timer
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn signals(&self) -> Signals {
        self.signals
    }

    pub fn blink(&self) -> bool {
        self.blink
    }

    pub fn capabilities(&self) -> Capabilities {
        self.bus.capabilities()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }
}

#[test]
fn timing_from_frequency() {
    let timing = Timing::from_frequency(48_000_000, 100).unwrap();
    assert_eq!(timing.period_cyc(), 480);
    assert_eq!(timing.us_cyc(), 48);
    assert_eq!(timing.timer_limit(), 48_000);

    let slow = Timing::from_frequency(1_000_000, 1).unwrap();
    assert_eq!(slow.period_cyc(), 1000);
    assert_eq!(slow.timer_limit(), 1000);
}

#[test]
fn timing_rejects_unresolvable_rates() {
    assert_eq!(
        Timing::from_frequency(48_000_000, 0),
        Err(TimingError::ZeroFrequency)
    );
    assert_eq!(
        Timing::from_frequency(1_000_000, 2000),
        Err(TimingError::FrequencyTooHigh {
            tick_rate_hz: 1_000_000,
            frequency_khz: 2000
        })
    );
    assert_eq!(
        Timing::from_frequency(500_000, 1),
        Err(TimingError::TickRateTooLow(500_000))
    );
    assert_eq!(Timing::new(1, u32::MAX), Err(TimingError::OutOfRange));
    assert_eq!(Timing::new(0, 1), Err(TimingError::OutOfRange));
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use rbb_protocol::Command;

    use super::{Engine, Tick, Timing};
    use crate::{Capabilities, SignalBus, Signals};

    #[derive(Default)]
    struct TestBus {
        tdo: bool,
        drives: Vec<Signals>,
        indicator: Option<bool>,
        samples: usize,
    }

    impl SignalBus for TestBus {
        fn capabilities(&self) -> Capabilities {
            Capabilities::full()
        }

        fn drive(&mut self, signals: Signals) {
            self.drives.push(signals);
        }

        fn sample_tdo(&mut self) -> bool {
            self.samples += 1;
            self.tdo
        }

        fn set_indicator(&mut self, on: bool) {
            self.indicator = Some(on);
        }
    }

    const PERIOD: u32 = 5;
    const US: u32 = 3;

    fn engine() -> Engine<TestBus> {
        Engine::new(TestBus::default(), Timing::new(PERIOD, US).unwrap())
    }

    /// Feeds `input` to the engine for `ticks` ticks.
    /// Returns the produced bytes and the tick index at which each input byte was consumed.
    fn run(engine: &mut Engine<TestBus>, input: &[u8], ticks: usize) -> (Vec<u8>, Vec<usize>) {
        let mut queue: VecDeque<u8> = input.iter().copied().collect();
        let mut output = Vec::new();
        let mut consumed_at = Vec::new();
        for tick in 0..ticks {
            let result = engine.tick(queue.front().copied(), true);
            assert!(engine.timer() < engine.timing().timer_limit());
            if result.consumed() {
                queue.pop_front();
                consumed_at.push(tick);
            }
            output.extend(result.output());
        }
        (output, consumed_at)
    }

    #[test]
    fn write_commands_drive_low_bits() {
        for byte in b'0'..=b'7' {
            let mut engine = engine();
            let tick = engine.tick(Some(byte), true);
            assert_eq!(tick, Tick::Executed(Command::from_byte(byte).unwrap()));
            let signals = engine.signals();
            assert_eq!(signals.tdi, byte & 1 != 0);
            assert_eq!(signals.tms, byte & 2 != 0);
            assert_eq!(signals.tck, byte & 4 != 0);
            assert_eq!(engine.bus().drives.last(), Some(&signals));
            assert_eq!(engine.timer(), PERIOD - 1);
        }
    }

    #[test]
    fn write_commands_are_spaced_by_period() {
        let mut engine = engine();
        let (_, consumed_at) = run(&mut engine, b"0404", 100);
        assert_eq!(consumed_at, vec![0, 5, 10, 15]);
    }

    #[test]
    fn reset_commands_have_no_delay() {
        let mut engine = engine();
        let (_, consumed_at) = run(&mut engine, b"rstu", 10);
        assert_eq!(consumed_at, vec![0, 1, 2, 3]);

        let drives = &engine.bus().drives;
        // drives[0] is the idle state driven at construction
        let resets: Vec<(bool, bool)> = drives[1..].iter().map(|s| (s.srst, s.trst)).collect();
        assert_eq!(
            resets,
            vec![(false, false), (true, false), (false, true), (true, true)]
        );
    }

    #[test]
    fn reset_keeps_jtag_lines() {
        let mut engine = engine();
        run(&mut engine, b"7u", 20);
        let signals = engine.signals();
        assert!(signals.tck && signals.tms && signals.tdi);
        assert!(signals.trst && signals.srst);
    }

    #[test]
    fn sample_reports_tdo() {
        let mut engine = engine();
        assert_eq!(engine.tick(Some(b'R'), true), Tick::Sampled(b'0'));
        engine.bus.tdo = true;
        assert_eq!(engine.tick(Some(b'R'), true), Tick::Sampled(b'1'));
        assert_eq!(engine.timer(), 0);
    }

    #[test]
    fn sample_waits_for_output_space() {
        let mut engine = engine();
        engine.bus.tdo = true;
        for _ in 0..10 {
            let tick = engine.tick(Some(b'R'), false);
            assert_eq!(tick, Tick::Backpressure);
            assert!(!tick.consumed());
        }
        assert_eq!(engine.bus().samples, 0);
        assert_eq!(engine.tick(Some(b'R'), true), Tick::Sampled(b'1'));
    }

    #[test]
    fn long_sleep_delays_sample() {
        let mut engine = engine();
        engine.bus.tdo = true;
        let (output, consumed_at) = run(&mut engine, b"ZR", 5000);
        assert_eq!(output, b"1".to_vec());
        assert_eq!(consumed_at, vec![0, (1000 * US) as usize]);
    }

    #[test]
    fn short_sleep_delays_sample() {
        let mut engine = engine();
        let (output, consumed_at) = run(&mut engine, b"zR", 50);
        assert_eq!(output, b"0".to_vec());
        assert_eq!(consumed_at, vec![0, US as usize]);
    }

    #[test]
    fn unknown_command_halts() {
        let mut engine = engine();
        let (output, consumed_at) = run(&mut engine, b"RXR", 1000);
        assert_eq!(output, b"0".to_vec());
        assert_eq!(consumed_at, vec![0]);
        assert_eq!(engine.tick(Some(b'X'), true), Tick::Halted(b'X'));
    }

    #[test]
    fn blink_switches_indicator() {
        let mut engine = engine();
        assert_eq!(engine.bus().indicator, Some(false));
        let (_, consumed_at) = run(&mut engine, b"B", 2);
        assert_eq!(consumed_at, vec![0]);
        assert!(engine.blink());
        assert_eq!(engine.bus().indicator, Some(true));
        run(&mut engine, b"b", 2);
        assert!(!engine.blink());
        assert_eq!(engine.bus().indicator, Some(false));
    }

    #[test]
    fn quit_is_consumed_without_effect() {
        let mut engine = engine();
        let before = engine.signals();
        assert_eq!(engine.tick(Some(b'Q'), true), Tick::Executed(Command::Quit));
        assert_eq!(engine.signals(), before);
        assert_eq!(engine.timer(), 0);
    }

    #[test]
    fn idle_without_input() {
        let mut engine = engine();
        assert_eq!(engine.tick(None, true), Tick::Idle);
        engine.tick(Some(b'1'), true);
        assert_eq!(engine.tick(None, true), Tick::Waiting);
    }

    #[test]
    fn fast_forward_matches_waiting_ticks() {
        let mut engine = engine();
        engine.tick(Some(b'Z'), true);
        assert_eq!(engine.timer(), 1000 * US - 1);
        assert_eq!(engine.fast_forward(1000), 1000);
        assert_eq!(engine.timer(), 1000 * US - 1 - 1000);
        assert_eq!(engine.fast_forward(u32::MAX), 1000 * US - 1 - 1000);
        assert_eq!(engine.timer(), 0);
        assert_eq!(engine.fast_forward(10), 0);
    }
}
