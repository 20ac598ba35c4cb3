//! MCP3008 10-bit SPI ADC channel, used for the analog soil-moisture, LDR
//! and rain probes.
//!
//! Each port owns its own handle on `/dev/spidev0.0`; the kernel serialises
//! transfers from several handles on the same device.

use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::sensor::{percent_between, SensorError, SensorPort};

/// 1 MHz is comfortably inside the MCP3008's 3.6 MHz limit at 5 V and its
/// 1.35 MHz limit at 2.7 V.
const CLOCK_HZ: u32 = 1_000_000;

/// Highest single-ended channel index.
pub const MAX_CHANNEL: u8 = 7;

/// Build the 3-byte command for a single-ended read on `channel`:
/// start bit, then SGL=1 and the 3-bit channel in the high nibble.
fn command_for_channel(channel: u8) -> [u8; 3] {
    [0x01, (0x08 | channel) << 4, 0x00]
}

/// Extract the 10-bit result from the response bytes.
fn decode_response(rx: &[u8; 3]) -> u16 {
    (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2])
}

pub struct Mcp3008Channel {
    spi: Spi,
    channel: u8,
    /// Raw value that maps to 0 %.
    raw_low: f64,
    /// Raw value that maps to 100 %.
    raw_high: f64,
}

impl Mcp3008Channel {
    pub fn new(channel: u8, raw_low: f64, raw_high: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "MCP3008 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, CLOCK_HZ, Mode::Mode0)?;
        tracing::info!(channel, raw_low, raw_high, "mcp3008 channel initialised");
        Ok(Self {
            spi,
            channel,
            raw_low,
            raw_high,
        })
    }

    fn read_raw(&mut self) -> Result<u16, SensorError> {
        let tx = command_for_channel(self.channel);
        let mut rx = [0u8; 3];
        self.spi
            .transfer(&mut rx, &tx)
            .map_err(|e| SensorError::Hardware(e.to_string()))?;
        Ok(decode_response(&rx))
    }
}

impl SensorPort for Mcp3008Channel {
    fn read(&mut self) -> Result<f64, SensorError> {
        let raw = self.read_raw()?;
        let pct = percent_between(f64::from(raw), self.raw_low, self.raw_high);
        Ok((pct * 10.0).round() / 10.0)
    }

    fn describe(&self) -> String {
        format!("mcp3008:ch{}", self.channel)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
