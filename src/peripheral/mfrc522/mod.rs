//! MFRC522 contactless reader driver.
//!
//! The chip sits on a shared four-wire serial bus (mode 0, up to 5 MHz) plus
//! an optional open-drain reset line. The driver owns the bus and clock
//! capabilities for the lifetime of the handle; callers must serialize access
//! to one handle themselves.

pub mod consts;
pub mod drivers;
pub mod dump;
pub mod mifare;
pub mod pcd;
pub mod picc;

#[cfg(test)]
pub(crate) mod mock;


use crate::clock::Clock;
use consts::PcdError;

/// Bus access the driver consumes: a chip-select framed byte pipe plus the
/// reset line, if one is wired up.
///
/// `begin`/`end` bracket every multi-byte transaction so a shared bus can be
/// re-arbitrated between devices. Implementations select mode 0 and a clock
/// of at most 5 MHz on `begin`.
pub trait Bus {
    fn begin(&mut self) -> Result<(), PcdError>;

    fn end(&mut self);

    /// Full-duplex byte exchange. `keep_cs` keeps the chip selected after
    /// this byte so the transaction can continue.
    fn transfer(&mut self, keep_cs: bool, tx: u8) -> Result<u8, PcdError>;

    /// Sample the reset line. `None` when no reset line is configured.
    fn reset_level(&mut self) -> Option<bool> {
        None
    }

    /// Drive the reset line. No-op without one.
    fn set_reset(&mut self, _high: bool) {}
}

/// Exclusive handle to one MFRC522.
///
/// Created by [`Mfrc522::init`], which resets the chip and leaves it with the
/// antenna on.
pub struct Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    bus: B,
    clock: C,
}

impl<B, C> Mfrc522<B, C>
where
    B: Bus,
    C: Clock,
{
    /// Take ownership of the bus and clock and bring the chip up: hard reset
    /// over the reset line when the chip reads powered-down, soft reset
    /// otherwise, then timer, modulation and antenna setup.
    pub fn init(bus: B, clock: C) -> Result<Self, PcdError> {
        let mut pcd = Self { bus, clock };
        pcd.setup()?;
        Ok(pcd)
    }

    /// Release the underlying bus and clock.
    pub fn release(self) -> (B, C) {
        (self.bus, self.clock)
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub(crate) fn sleep_ms(&self, ms: u64) {
        self.clock.sleep_ms(ms);
    }

    pub(crate) fn sleep_us(&self, us: u64) {
        self.clock.sleep_us(us);
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
