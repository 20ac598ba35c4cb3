//! Pump relay via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation only tracks and logs the state.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct PumpRelay {
    pin: OutputPin,
    active_low: bool, // most pump relay modules are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl PumpRelay {
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let pin = gpio.get(gpio_pin)?.into_output();
        let mut relay = Self {
            pin,
            active_low,
            on: true,
        };
        // Fail-safe: pump OFF at startup
        relay.set(false);
        info!(gpio_pin, active_low, "pump relay initialised");
        Ok(relay)
    }

    pub fn set(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if self.on != on {
            info!(pin = self.pin.pin(), "pump relay {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct PumpRelay {
    gpio_pin: u8,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl PumpRelay {
    pub fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        info!(gpio_pin, "[mock-gpio] pump relay initialised (no hardware)");
        Ok(Self { gpio_pin, on: false })
    }

    pub fn set(&mut self, on: bool) {
        if self.on != on {
            info!(
                gpio_pin = self.gpio_pin,
                "[mock-gpio] pump relay {}",
                if on { "ON" } else { "OFF" }
            );
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================
