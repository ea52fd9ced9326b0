use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info, warn};

use super::{block_address, Checksum, FirmwareImage, FirmwareSource};
use crate::boot::{self, BLOCK_SIZE, BUSY, BUSY_POLL_LIMIT, FRAME_LEN};
use crate::power::Power;
use crate::{timing, Error, IrqMask, KeySink, Touchkey};

/// Programming sessions per update, the first included.
const FLASH_ATTEMPTS: u8 = 2;

/// Steps of one programming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashState {
  BootEntry,
  ModeCheck,
  Erase,
  /// Writing the block with this index; block 0 is the header.
  Writing(usize),
  ChecksumReadback,
  ModeExit,
  Verify,
  Retry,
}

/// Bookkeeping of one update, kept across retries.
struct FlashSession<E> {
  total_blocks: usize,
  attempt: u8,
  checksum: Checksum,
  failure: Option<Error<E>>,
}

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  /// Program `image` through the bootloader and verify it.
  ///
  /// A failed check restarts the whole session from bootloader entry, up to
  /// [`FLASH_ATTEMPTS`] sessions. A rejected block frame or bootloader entry
  /// ends the update at once. Whichever way it fails, the device is power
  /// cycled back out of the bootloader before this returns.
  pub(crate) async fn flash(&self, _mask: &IrqMask<'_, M>, image: &FirmwareImage<'_>) -> Result<(), Error<E>> {
    let result = self.program(image).await;
    if result.is_err() {
      self.recover_after_flash().await;
    }
    result
  }

  async fn program(&self, image: &FirmwareImage<'_>) -> Result<(), Error<E>> {
    let mut session =
      FlashSession { total_blocks: image.block_count(), attempt: 1, checksum: Checksum::default(), failure: None };
    let mut state = FlashState::BootEntry;

    info!("touchkey: flashing {} blocks", session.total_blocks.saturating_sub(1));

    loop {
      debug!("touchkey: flash {:?}", state);

      match state {
        FlashState::BootEntry => {
          self.power_cycle().await?;
          self.sleep_ms(timing::BOOT_DELAY_MS).await;
          if let Err(e) = self.bus.send(&boot::ENTER).await {
            error!("touchkey: bootloader entry failed");
            return Err(e);
          }
          state = FlashState::ModeCheck;
        }

        FlashState::ModeCheck => {
          self.sleep_ms(timing::MODE_ENTER_MS).await;
          let mut id = [0u8; 1];
          state = match self.bus.recv(&mut id).await {
            Ok(()) if self.config.chip.accepts_flash_mode(id[0]) => {
              debug!("touchkey: flash mode {:#04x}", id[0]);
              FlashState::Erase
            }
            Ok(()) => {
              error!("touchkey: not in flash mode, got {:#04x}", id[0]);
              session.failure = Some(Error::Protocol(id[0]));
              FlashState::Retry
            }
            Err(e) => {
              error!("touchkey: flash mode read failed");
              session.failure = Some(e);
              FlashState::Retry
            }
          };
        }

        FlashState::Erase => {
          if self.bus.send(&boot::ERASE).await.is_err() {
            warn!("touchkey: erase command failed");
          }
          self.sleep_ms(timing::ERASE_MS).await;
          state = FlashState::Writing(1);
        }

        FlashState::Writing(index) => {
          let Some(block) = image.block(index) else {
            state = FlashState::ChecksumReadback;
            continue;
          };
          let address = block_address(index);
          self.write_block(address, block).await?;
          state = FlashState::Writing(index + 1);
        }

        FlashState::ChecksumReadback => {
          session.checksum = self.read_checksum().await;
          state = FlashState::ModeExit;
        }

        FlashState::ModeExit => {
          if self.bus.send(&boot::EXIT).await.is_err() {
            warn!("touchkey: bootloader exit failed");
          }
          let expected = image.checksum();
          if session.checksum == expected {
            info!("touchkey: checksum ok");
            state = FlashState::Verify;
          } else {
            error!(
              "touchkey: checksum {:02X}{:02X}, image {:02X}{:02X}",
              session.checksum.high, session.checksum.low, expected.high, expected.low
            );
            session.failure = Some(Error::ChecksumMismatch { expected, actual: session.checksum });
            state = FlashState::Retry;
          }
        }

        FlashState::Verify => {
          self.power_cycle().await?;
          self.sleep_ms(timing::RESET_DELAY_MS).await;
          match self.read_firmware_version().await {
            Ok(0) => {
              error!("touchkey: firmware version 0 after flashing");
              session.failure = Some(Error::VersionMismatch { expected: image.version(), actual: 0 });
            }
            Ok(v) if image.source() == FirmwareSource::Bundled && v != image.version() => {
              error!("touchkey: firmware version {:#04x}, image {:#04x}", v, image.version());
              session.failure = Some(Error::VersionMismatch { expected: image.version(), actual: v });
            }
            Ok(v) => {
              info!("touchkey: flashed firmware {:#04x}", v);
              return Ok(());
            }
            Err(e) => {
              error!("touchkey: firmware version read failed");
              session.failure = Some(e);
            }
          }
          state = FlashState::Retry;
        }

        FlashState::Retry => {
          let kind = session.failure.take().map_or("unknown", |e| e.kind());
          if session.attempt < FLASH_ATTEMPTS {
            warn!("touchkey: flash attempt {} failed ({}), retrying", session.attempt, kind);
            session.attempt += 1;
            state = FlashState::BootEntry;
            continue;
          }
          error!("touchkey: flashing failed after {} attempts, last {}", FLASH_ATTEMPTS, kind);
          return Err(Error::Flash);
        }
      }
    }
  }

  /// One block frame followed by the busy wait.
  async fn write_block(&self, address: u16, block: &[u8]) -> Result<(), Error<E>> {
    let mut frame = [0u8; FRAME_LEN];
    frame[..2].copy_from_slice(&boot::WRITE);
    frame[2..4].copy_from_slice(&address.to_be_bytes());
    frame[4..4 + BLOCK_SIZE].copy_from_slice(block);

    if self.bus.send(&frame).await.is_err() {
      error!("touchkey: block write failed at {:#06x}", address);
      return Err(Error::Write { address });
    }
    self.sleep_ms(timing::BLOCK_WRITE_MS).await;
    self.wait_while_busy().await;
    Ok(())
  }

  /// Poll the bootloader status until the busy bit clears. Gives up quietly
  /// after the poll limit, the checksum catches a block that did not land.
  async fn wait_while_busy(&self) {
    let mut status = [0u8; 1];
    for _ in 0..BUSY_POLL_LIMIT {
      if self.bus.poll(&mut status).await.is_err() {
        warn!("touchkey: busy poll read failed");
        return;
      }
      if status[0] & BUSY == 0 {
        return;
      }
    }
    error!("touchkey: still busy after {} polls", BUSY_POLL_LIMIT);
  }

  async fn read_checksum(&self) -> Checksum {
    if self.bus.send(&boot::CHECKSUM_RANGE).await.is_err() {
      warn!("touchkey: checksum range command failed");
    }
    self.sleep_ms(timing::CHECKSUM_STEP_MS).await;
    if self.bus.send(&boot::CHECKSUM_TRIGGER).await.is_err() {
      warn!("touchkey: checksum trigger failed");
    }
    self.sleep_ms(timing::CHECKSUM_STEP_MS).await;

    let mut buf = [0u8; 6];
    if self.bus.recv(&mut buf).await.is_err() {
      error!("touchkey: checksum read failed");
    }
    debug!("touchkey: checksum readback {:02X?}", buf);
    Checksum { high: buf[4], low: buf[5] }
  }

  /// Bring a device that failed programming back to normal mode.
  async fn recover_after_flash(&self) {
    if self.power_cycle().await.is_err() {
      error!("touchkey: power cycle after failed flash failed");
      return;
    }
    self.sleep_ms(timing::RESET_DELAY_MS).await;
    match self.read_firmware_version().await {
      Ok(v) => info!("touchkey: firmware after failed flash {:#04x}", v),
      Err(_) => error!("touchkey: device silent after failed flash"),
    }
  }
}
