use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::i2c::Error as _;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{error, warn};

use crate::reg::timing::BUS_RETRY_MS;
use crate::Error;

/// Attempts per bus sub-transaction before the error is surfaced.
pub(crate) const BUS_ATTEMPTS: u8 = 3;

/// Run one bus operation up to [`BUS_ATTEMPTS`] times, sleeping
/// [`BUS_RETRY_MS`] between attempts.
macro_rules! retry {
  ($self:ident, $what:literal, $op:expr) => {{
    let mut attempt = 1;
    loop {
      match $op.await {
        Ok(v) => break Ok(v),
        Err(e) if attempt < BUS_ATTEMPTS => {
          warn!("touchkey: {} failed ({:?}), attempt {}", $what, e.kind(), attempt);
          $self.delay.clone().delay_ms(BUS_RETRY_MS).await;
          attempt += 1;
        }
        Err(e) => {
          error!("touchkey: {} failed ({:?}), giving up", $what, e.kind());
          break Err(Error::Bus(e));
        }
      }
    }
  }};
}

/// Register-level access to the controller.
///
/// Every operation holds the bus lock from its first to its last
/// sub-transaction, so at most one transaction is in flight no matter how
/// many contexts share the driver.
pub(crate) struct Transport<M: RawMutex, I, D> {
  i2c: Mutex<M, I>,
  delay: D,
  address: u8,
}

impl<M, I, D> Transport<M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress>,
  D: DelayNs + Clone,
{
  pub(crate) fn new(i2c: I, delay: D, address: u8) -> Self {
    Self { i2c: Mutex::new(i2c), delay, address }
  }

  /// Read `buf.len()` bytes starting at `reg`: an address-select write
  /// followed by a separate data read, each retried on its own.
  pub(crate) async fn read(&self, reg: impl Into<u8>, buf: &mut [u8]) -> Result<(), Error<I::Error>> {
    let reg = [reg.into()];
    let mut i2c = self.i2c.lock().await;
    retry!(self, "address set", i2c.write(self.address, &reg))?;
    retry!(self, "data read", i2c.read(self.address, buf))
  }

  pub(crate) async fn read_u8(&self, reg: impl Into<u8>) -> Result<u8, Error<I::Error>> {
    let mut buf = [0u8; 1];
    self.read(reg, &mut buf).await?;
    Ok(buf[0])
  }

  pub(crate) async fn read_u16(&self, reg: impl Into<u8>) -> Result<u16, Error<I::Error>> {
    let mut buf = [0u8; 2];
    self.read(reg, &mut buf).await?;
    Ok(u16::from_be_bytes(buf))
  }

  /// Two adjacent big-endian words.
  pub(crate) async fn read_u16_pair(&self, reg: impl Into<u8>) -> Result<(u16, u16), Error<I::Error>> {
    let mut buf = [0u8; 4];
    self.read(reg, &mut buf).await?;
    Ok((u16::from_be_bytes([buf[0], buf[1]]), u16::from_be_bytes([buf[2], buf[3]])))
  }

  /// Write one byte to `reg` as a single combined transaction.
  pub(crate) async fn write(&self, reg: impl Into<u8>, value: u8) -> Result<(), Error<I::Error>> {
    let frame = [reg.into(), value];
    let mut i2c = self.i2c.lock().await;
    retry!(self, "register write", i2c.write(self.address, &frame))
  }

  /// Raw frame for bootloader commands. Sent once: a repeated frame would
  /// be a different command to the bootloader.
  pub(crate) async fn send(&self, frame: &[u8]) -> Result<(), Error<I::Error>> {
    let mut i2c = self.i2c.lock().await;
    i2c.write(self.address, frame).await.map_err(Error::Bus)
  }

  /// Raw read without an address phase, retried like a data read.
  pub(crate) async fn recv(&self, buf: &mut [u8]) -> Result<(), Error<I::Error>> {
    let mut i2c = self.i2c.lock().await;
    retry!(self, "raw read", i2c.read(self.address, buf))
  }

  /// Single raw read attempt, for polling loops that retry on their own.
  pub(crate) async fn poll(&self, buf: &mut [u8]) -> Result<(), Error<I::Error>> {
    let mut i2c = self.i2c.lock().await;
    i2c.read(self.address, buf).await.map_err(Error::Bus)
  }
}
