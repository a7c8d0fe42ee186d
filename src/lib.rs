#![cfg_attr(not(test), no_std)]

use arbitrary_int::u3;
use bitbybit::{bitenum, bitfield};
use embedded_hal::spi::{self, Operation, SpiDevice};
use serde::{Deserialize, Serialize};

/// Number of 32 bit configuration registers
pub const CONFIG_REGS: usize = 7;
/// Number of 32 bit result registers
pub const RESULT_REGS: usize = 4;
/// Reference clock the Q16.16 time results are scaled by
pub const REF_CLOCK_HZ: u32 = 4_000_000;

/// SPI opcodes
///
/// Indexed register access adds the register index to the
/// `WriteCfg`/`ReadRes` base opcodes.
#[bitenum(u8)]
#[derive(Debug, PartialEq)]
pub enum Opcode {
    /// Power-on reset
    Por = 0x50,
    /// Initiate a measurement cycle
    Init = 0x70,
    /// Write configuration register, plus register index
    WriteCfg = 0x80,
    /// Read result register, plus register index
    ReadRes = 0xb0,
    /// Read the status register
    ReadStat = 0xb4,
    /// Read back the most significant byte of configuration register 1
    ReadCfg1Msb = 0xb5,
}

/// Bit assignments of configuration register 1
#[bitfield(u32)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Cfg1 {
    /// Expected hits on channel 1
    ///
    /// In measurement mode 2 the start pulse counts as the first hit, so
    /// valid counts are 2 to 4. The encoding is the count itself.
    #[bits(16..=18, rw)]
    pub expected_hits: u3,
}

/// Bit assignments of configuration register 6
#[bitfield(u32)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Cfg6 {
    /// Double resolution mode, mutually exclusive with quad
    #[bit(12, rw)]
    pub double_res: bool,
    /// Quad resolution mode, mutually exclusive with double
    #[bit(13, rw)]
    pub quad_res: bool,
}

/// In-memory image of the seven configuration registers.
///
/// The image reflects what the caller intends the chip to hold. It is not
/// synchronized automatically: the field accessors only mutate the image,
/// and [`Gp22::write_config`] pushes it to the chip in one batch. Each
/// register is transferred as its four big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config([u32; CONFIG_REGS]);

impl Config {
    pub const fn new(regs: [u32; CONFIG_REGS]) -> Self {
        Self(regs)
    }

    pub const fn regs(&self) -> &[u32; CONFIG_REGS] {
        &self.0
    }

    fn cfg1(&self) -> Cfg1 {
        Cfg1::new_with_raw_value(self.0[1])
    }

    fn cfg6(&self) -> Cfg6 {
        Cfg6::new_with_raw_value(self.0[6])
    }

    /// Set the expected hit count (2 to 4).
    ///
    /// Counts outside that range leave the image unchanged.
    pub fn set_expected_hits(&mut self, hits: u8) {
        if (2..=4).contains(&hits) {
            self.0[1] = self.cfg1().with_expected_hits(u3::new(hits)).raw_value();
        }
    }

    /// The raw 3 bit hit count encoding
    pub fn expected_hits(&self) -> u8 {
        self.cfg1().expected_hits().value()
    }

    /// Single resolution is the absence of double and quad.
    /// Enabling it clears both; disabling it is a no-op.
    pub fn set_single_res(&mut self, on: bool) {
        if on {
            self.0[6] = self
                .cfg6()
                .with_double_res(false)
                .with_quad_res(false)
                .raw_value();
        }
    }

    pub fn single_res(&self) -> bool {
        !self.double_res() && !self.quad_res()
    }

    pub fn set_double_res(&mut self, on: bool) {
        let mut cfg = self.cfg6().with_double_res(on);
        if on {
            cfg = cfg.with_quad_res(false);
        }
        self.0[6] = cfg.raw_value();
    }

    pub fn double_res(&self) -> bool {
        self.cfg6().double_res()
    }

    pub fn set_quad_res(&mut self, on: bool) {
        let mut cfg = self.cfg6().with_quad_res(on);
        if on {
            cfg = cfg.with_double_res(false);
        }
        self.0[6] = cfg.raw_value();
    }

    pub fn quad_res(&self) -> bool {
        self.cfg6().quad_res()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("SPI")]
    Bus(spi::ErrorKind),
}

impl<E: spi::Error> From<E> for Error {
    fn from(value: E) -> Self {
        Self::Bus(value.kind())
    }
}

/// Convert a raw Q16.16 measurement to microseconds.
///
/// The raw value counts reference clock periods. Single precision: near
/// full scale (about 16.4 ms) the result quantizes to tens of nanoseconds.
pub fn raw_to_micros(raw: u32) -> f32 {
    let lsb = 1e6 / ((1u64 << 16) as f32 * REF_CLOCK_HZ as f32);
    raw as f32 * lsb
}

/// TDC-GP22 driver
///
/// The `SpiDevice` must be configured for SPI mode 1, MSB first, with a
/// clock of at most 20 MHz. One driver method call is at most one bus
/// transaction; chip select stays asserted across the opcode and its
/// payload bytes and is released when the transaction ends.
#[derive(Clone, Debug)]
pub struct Gp22<B> {
    bus: B,
    config: Config,
}

impl<B: SpiDevice<u8>> Gp22<B> {
    /// Store the bus and the configuration image to push on `init()`.
    pub fn new(bus: B, config: Config) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Hand the bus back
    pub fn release(self) -> B {
        self.bus
    }

    fn command(&mut self, opcode: u8) -> Result<(), Error> {
        Ok(self.bus.write(&[opcode])?)
    }

    fn read(&mut self, opcode: u8, data: &mut [u8]) -> Result<(), Error> {
        Ok(self.bus.transaction(&mut [
            Operation::Write(&[opcode]),
            Operation::Read(data),
        ])?)
    }

    /// Reset the chip and push the configuration image.
    ///
    /// Must be called before measuring or reading back configuration.
    pub fn init(&mut self) -> Result<(), Error> {
        self.command(Opcode::Por.raw_value())?;
        self.write_config()?;
        log::info!("GP22 initialized");
        Ok(())
    }

    /// Arm a single measurement cycle.
    ///
    /// No response. The caller waits out the measurement before reading
    /// results; the chip does not signal completion through this driver.
    pub fn start_measurement(&mut self) -> Result<(), Error> {
        self.command(Opcode::Init.raw_value())
    }

    /// The 16 bit status register, undecoded
    pub fn status(&mut self) -> Result<u16, Error> {
        let mut stat = [0; 2];
        self.read(Opcode::ReadStat.raw_value(), &mut stat)?;
        Ok(u16::from_be_bytes(stat))
    }

    /// Read result register `index`.
    ///
    /// Indices 4 and above return 0 without touching the bus,
    /// indistinguishable from a genuine zero reading.
    pub fn result(&mut self, index: u8) -> Result<u32, Error> {
        if index >= RESULT_REGS as u8 {
            return Ok(0);
        }
        let mut res = [0; 4];
        self.read(Opcode::ReadRes.raw_value() + index, &mut res)?;
        Ok(u32::from_be_bytes(res))
    }

    /// Read back one configuration byte and compare it against the image.
    ///
    /// The chip echoes the most significant byte of configuration
    /// register 1, so this only proves anything after the image has been
    /// written at least once.
    pub fn test_communication(&mut self) -> Result<bool, Error> {
        let mut echo = [0; 1];
        self.read(Opcode::ReadCfg1Msb.raw_value(), &mut echo)?;
        Ok(echo[0] == self.config.0[1].to_be_bytes()[0])
    }

    /// Push the whole configuration image, one transaction per register.
    pub fn write_config(&mut self) -> Result<(), Error> {
        for (i, reg) in self.config.0.iter().enumerate() {
            self.bus.transaction(&mut [
                Operation::Write(&[Opcode::WriteCfg.raw_value() + i as u8]),
                Operation::Write(&reg.to_be_bytes()),
            ])?;
        }
        Ok(())
    }
}
