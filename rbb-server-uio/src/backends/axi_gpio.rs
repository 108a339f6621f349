//! # AXI GPIO Backend
//!
//! For JTAG pins wired to the first channel of an AXI GPIO block that is exposed via
//! the Linux UIO subsystem.
//!
//! ## Example Usage
//!
//! ```ignore
//! use rbb_server::server::Builder;
//!
//! let bus = AxiGpioBackend::new("/dev/uio0", PinMap::default())?;
//! let mut server = Builder::new().build(bus)?;
//! server.listen(&"tcp:127.0.0.1:2222".parse()?, CancellationToken::new()).await?;
//! ```
use std::{
    error::Error,
    fmt::Display,
    fs::OpenOptions,
    io,
    num::NonZero,
    path::Path,
    ptr::{NonNull, read_volatile, write_volatile},
};

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use rbb_server::{Capabilities, SignalBus, Signals};

const GPIO_DATA_OFFSET: usize = 0x0;
/// Direction register of channel 1. A set bit makes the pin an input.
const GPIO_TRI_OFFSET: usize = 0x4;

const MAP_SIZE: usize = 0x10000;

/// Width of a GPIO channel
pub const PIN_COUNT: u8 = 32;

/// Assignment of JTAG lines to GPIO bits
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PinMap {
    pub tck: u8,
    pub tms: u8,
    pub tdi: u8,
    pub tdo: u8,
    /// Active-low nTRST
    pub trst: Option<u8>,
    /// Active-low nSRST
    pub srst: Option<u8>,
    pub led: Option<u8>,
}

impl Default for PinMap {
    fn default() -> Self {
        PinMap {
            tck: 0,
            tms: 1,
            tdi: 2,
            tdo: 3,
            trst: None,
            srst: None,
            led: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PinError {
    OutOfRange { line: &'static str, pin: u8 },
    Duplicate { pin: u8, first: &'static str, second: &'static str },
}

impl Display for PinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinError::OutOfRange { line, pin } => write!(
                f,
                "Pin {} for {} is out of range (0..{})",
                pin, line, PIN_COUNT
            ),
            PinError::Duplicate { pin, first, second } => {
                write!(f, "Pin {} is assigned to both {} and {}", pin, first, second)
            }
        }
    }
}

impl Error for PinError {}

impl PinMap {
    fn assigned(&self) -> impl Iterator<Item = (&'static str, u8)> {
        [
            ("tck", Some(self.tck)),
            ("tms", Some(self.tms)),
            ("tdi", Some(self.tdi)),
            ("tdo", Some(self.tdo)),
            ("trst", self.trst),
            ("srst", self.srst),
            ("led", self.led),
        ]
        .into_iter()
        .filter_map(|(line, pin)| pin.map(|pin| (line, pin)))
    }

    /// Checks that every pin exists and no pin is used twice.
    pub fn validate(&self) -> Result<(), PinError> {
        let mut used: [Option<&'static str>; PIN_COUNT as usize] = [None; PIN_COUNT as usize];
        for (line, pin) in self.assigned() {
            let slot = used
                .get_mut(usize::from(pin))
                .ok_or(PinError::OutOfRange { line, pin })?;
            if let Some(first) = *slot {
                return Err(PinError::Duplicate {
                    pin,
                    first,
                    second: line,
                });
            }
            *slot = Some(line);
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_trst: self.trst.is_some(),
            has_srst: self.srst.is_some(),
            has_indicator: self.led.is_some(),
        }
    }

    /// Value of the direction register: TDO and all unused pins are inputs.
    fn tri_state(&self) -> u32 {
        let outputs = self
            .assigned()
            .filter(|(line, _)| *line != "tdo")
            .fold(0u32, |mask, (_, pin)| mask | 1 << pin);
        !outputs
    }

    /// Data register value for `signals`, keeping the indicator bit of `data`.
    fn apply(&self, data: u32, signals: Signals) -> u32 {
        let mut data = data;
        let mut set = |pin: u8, level: bool| {
            if level {
                data |= 1 << pin;
            } else {
                data &= !(1 << pin);
            }
        };
        set(self.tck, signals.tck);
        set(self.tms, signals.tms);
        set(self.tdi, signals.tdi);
        if let Some(pin) = self.trst {
            set(pin, !signals.trst);
        }
        if let Some(pin) = self.srst {
            set(pin, !signals.srst);
        }
        data
    }

    fn with_indicator(&self, data: u32, on: bool) -> u32 {
        match self.led {
            Some(pin) if on => data | 1 << pin,
            Some(pin) => data & !(1 << pin),
            None => data,
        }
    }
}

/// Signal bus on a memory-mapped AXI GPIO block
pub struct AxiGpioBackend {
    gpio: *mut u32,
    pins: PinMap,
    /// Last value written to the data register. Reading the register would return
    /// the input levels for input pins.
    data: u32,
}

impl AxiGpioBackend {
    pub fn new(path: impl AsRef<Path>, pins: PinMap) -> io::Result<AxiGpioBackend> {
        pins.validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let device_path = path.as_ref();
        log::debug!("Opening UIO device: {}", device_path.display());
        let file = OpenOptions::new().read(true).write(true).open(device_path)?;

        let map_size = NonZero::new(MAP_SIZE).ok_or_else(|| io::Error::other("Empty mapping"))?;
        let gpio = unsafe {
            log::debug!("Mapping UIO memory (size=0x{:x})", MAP_SIZE);
            let ptr = mmap(
                None,
                map_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?;
            ptr.as_ptr() as *mut u32
        };
        log::info!("UIO memory mapped successfully");

        let data = pins.apply(0, Signals::default());
        let mut backend = AxiGpioBackend { gpio, pins, data };
        // Settle the outputs before switching them from input to output
        backend.write_data(data);
        unsafe {
            write_volatile(backend.gpio.add(GPIO_TRI_OFFSET / 4), pins.tri_state());
        }
        log::debug!(
            "GPIO direction 0x{:08x}, data 0x{:08x}",
            pins.tri_state(),
            data
        );
        Ok(backend)
    }

    fn write_data(&mut self, data: u32) {
        self.data = data;
        unsafe {
            write_volatile(self.gpio.add(GPIO_DATA_OFFSET / 4), data);
        }
    }
}

impl Drop for AxiGpioBackend {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(self.gpio) {
            unsafe {
                // Release all pins
                write_volatile(self.gpio.add(GPIO_TRI_OFFSET / 4), u32::MAX);
                let _ = munmap(ptr.cast(), MAP_SIZE);
            }
        }
    }
}

impl SignalBus for AxiGpioBackend {
    fn capabilities(&self) -> Capabilities {
        self.pins.capabilities()
    }

    fn drive(&mut self, signals: Signals) {
        let data = self.pins.apply(self.data, signals);
        if data != self.data {
            self.write_data(data);
        }
    }

    fn sample_tdo(&mut self) -> bool {
        let data = unsafe { read_volatile(self.gpio.add(GPIO_DATA_OFFSET / 4)) };
        data & (1 << self.pins.tdo) != 0
    }

    fn set_indicator(&mut self, on: bool) {
        let data = self.pins.with_indicator(self.data, on);
        if data != self.data {
            self.write_data(data);
        }
    }
}

#[cfg(test)]
mod test {
    use rbb_server::Signals;

    use super::{PinError, PinMap};

    fn full_map() -> PinMap {
        PinMap {
            trst: Some(4),
            srst: Some(5),
            led: Some(8),
            ..PinMap::default()
        }
    }

    #[test]
    fn default_pins_are_valid() {
        assert_eq!(PinMap::default().validate(), Ok(()));
        assert_eq!(full_map().validate(), Ok(()));
        assert!(!PinMap::default().capabilities().has_trst);
        assert!(full_map().capabilities().has_indicator);
    }

    #[test]
    fn reject_invalid_pins() {
        let map = PinMap {
            tdo: 32,
            ..PinMap::default()
        };
        assert_eq!(
            map.validate(),
            Err(PinError::OutOfRange {
                line: "tdo",
                pin: 32
            })
        );

        let map = PinMap {
            led: Some(1),
            ..PinMap::default()
        };
        assert_eq!(
            map.validate(),
            Err(PinError::Duplicate {
                pin: 1,
                first: "tms",
                second: "led"
            })
        );
    }

    #[test]
    fn only_driven_lines_are_outputs() {
        assert_eq!(PinMap::default().tri_state(), !0b0111);
        assert_eq!(full_map().tri_state(), !0b1_0011_0111);
    }

    #[test]
    fn resets_are_active_low() {
        let map = full_map();
        let idle = map.apply(0, Signals::default());
        assert_eq!(idle, 0b11_0000);

        let asserted = map.apply(
            idle,
            Signals {
                tck: true,
                trst: true,
                ..Signals::default()
            },
        );
        assert_eq!(asserted, 0b10_0001);
    }

    #[test]
    fn indicator_survives_drive() {
        let map = full_map();
        let data = map.with_indicator(0, true);
        let data = map.apply(
            data,
            Signals {
                tdi: true,
                ..Signals::default()
            },
        );
        assert_eq!(data, 1 << 8 | 0b11_0100);
        assert_eq!(map.with_indicator(data, false), 0b11_0100);
    }
}
