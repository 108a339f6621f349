//! A bus without hardware, for testing clients and the server itself.
use crate::{Capabilities, SignalBus, Signals};

/// Loopback bus: TDO returns the TDI level captured at the most recent rising TCK edge.
///
/// This behaves like a chain with a single one bit register, so a shifted vector
/// comes back delayed by one bit.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBus {
    capabilities: Capabilities,
    signals: Signals,
    captured: bool,
    rising_edges: u64,
    indicator: bool,
}

impl LoopbackBus {
    pub fn new(capabilities: Capabilities) -> LoopbackBus {
        LoopbackBus {
            capabilities,
            ..LoopbackBus::default()
        }
    }

    /// The levels currently on the bus. Absent reset lines always read deasserted.
    pub fn signals(&self) -> Signals {
        self.signals
    }

    pub fn rising_edges(&self) -> u64 {
        self.rising_edges
    }

    pub fn indicator(&self) -> bool {
        self.indicator
    }
}

impl SignalBus for LoopbackBus {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn drive(&mut self, signals: Signals) {
        if signals.tck && !self.signals.tck {
            self.captured = signals.tdi;
            self.rising_edges += 1;
            log::trace!("Loopback captured TDI={}", u8::from(signals.tdi));
        }
        self.signals = Signals {
            trst: signals.trst && self.capabilities.has_trst,
            srst: signals.srst && self.capabilities.has_srst,
            ..signals
        };
    }

    fn sample_tdo(&mut self) -> bool {
        self.captured
    }

    fn set_indicator(&mut self, on: bool) {
        if self.capabilities.has_indicator {
            self.indicator = on;
        }
    }
}

#[cfg(test)]
mod test {
    use super::LoopbackBus;
    use crate::{Capabilities, SignalBus, Signals};

    fn clock(bus: &mut LoopbackBus, tdi: bool) -> bool {
        bus.drive(Signals {
            tdi,
            ..Signals::default()
        });
        let tdo = bus.sample_tdo();
        bus.drive(Signals {
            tck: true,
            tdi,
            ..Signals::default()
        });
        tdo
    }

    #[test]
    fn returns_tdi_delayed_by_one_bit() {
        let mut bus = LoopbackBus::new(Capabilities::default());
        let tdo: Vec<bool> = [true, false, true, true]
            .into_iter()
            .map(|tdi| clock(&mut bus, tdi))
            .collect();
        assert_eq!(tdo, vec![false, true, false, true]);
        assert_eq!(bus.rising_edges(), 4);
    }

    #[test]
    fn tck_high_does_not_recapture() {
        let mut bus = LoopbackBus::new(Capabilities::default());
        bus.drive(Signals {
            tck: true,
            tdi: true,
            ..Signals::default()
        });
        bus.drive(Signals {
            tck: true,
            tdi: false,
            ..Signals::default()
        });
        assert!(bus.sample_tdo());
        assert_eq!(bus.rising_edges(), 1);
    }

    #[test]
    fn omits_absent_lines() {
        let mut bus = LoopbackBus::new(Capabilities {
            has_trst: true,
            has_srst: false,
            has_indicator: false,
        });
        bus.drive(Signals {
            trst: true,
            srst: true,
            ..Signals::default()
        });
        bus.set_indicator(true);
        assert!(bus.signals().trst);
        assert!(!bus.signals().srst);
        assert!(!bus.indicator());
    }
}
