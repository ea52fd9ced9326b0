use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info, warn};

use super::on_off;
use crate::power::Power;
use crate::{timing, Error, KeySink, Reg, Touchkey, CMD_OFF, CMD_ON};

/// Write attempts per SAR mode change.
const MODE_WRITE_ATTEMPTS: u8 = 3;
/// Extra passes when the mode read back is not the one requested. The device
/// is reset before the last one.
const MODE_CHANGE_RETRIES: u8 = 5;

/// Grip (SAR) enable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SarEnable {
  Off,
  On,
  /// Turn grip sensing off and keep it off: later `On`/`Off` requests only
  /// update the cached state.
  ForceOff,
  /// Leave force-off and apply the cached state again.
  ReleaseForceOff,
}

impl TryFrom<u8> for SarEnable {
  type Error = u8;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(SarEnable::Off),
      1 => Ok(SarEnable::On),
      2 => Ok(SarEnable::ForceOff),
      3 => Ok(SarEnable::ReleaseForceOff),
      v => Err(v),
    }
  }
}

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  pub async fn set_sar_enable(&self, request: SarEnable) -> Result<(), Error<E>> {
    let request = match request {
      SarEnable::ReleaseForceOff => {
        let enabled = self.with_state(|s| {
          s.modes.sar_force_off = false;
          s.modes.sar_enabled
        });
        info!("touchkey: grip force off released, enabled {}", enabled);
        if !enabled {
          return Ok(());
        }
        SarEnable::On
      }
      r => r,
    };

    let on = request == SarEnable::On;
    let forced = self.with_state(|s| {
      if s.modes.sar_force_off {
        s.modes.sar_enabled = on;
      }
      s.modes.sar_force_off
    });
    if forced {
      debug!("touchkey: grip forced off, caching {}", on);
      return Ok(());
    }

    if request == SarEnable::ForceOff {
      self.with_state(|s| s.modes.sar_force_off = true);
    }
    self.bus.write(Reg::SarEnable, on_off(on)).await?;

    if !on {
      self.release_grip();
      self.with_state(|s| s.grip.last_event = false);
    }
    self.with_state(|s| s.modes.sar_enabled = on);
    info!("touchkey: grip {:?}", request);
    Ok(())
  }

  pub(crate) async fn write_sar_sensing(&self, on: bool) {
    if self.bus.write(Reg::SarSensing, on_off(on)).await.is_err() {
      error!("touchkey: grip sensing {} failed", on);
    }
    self.with_state(|s| s.modes.sar_sensing = on);
  }

  /// Turn grip sensing on or off without touching the enable state.
  pub async fn set_sar_sensing(&self, on: bool) {
    self.write_sar_sensing(on).await;
  }

  /// An inserted earjack disturbs grip sensing, so sensing pauses while one
  /// is plugged in.
  pub async fn set_earjack(&self, inserted: bool) {
    info!("touchkey: earjack {}", if inserted { "inserted" } else { "removed" });
    self.write_sar_sensing(!inserted).await;
  }

  /// Switch between SAR-only and normal sensing, verifying the mode by
  /// reading it back.
  ///
  /// Skipped when the device is believed to be in the requested mode
  /// already.
  pub async fn set_sar_only_mode(&self, on: bool) -> Result<(), Error<E>> {
    if self.modes().sar_mode == on {
      debug!("touchkey: already in {} mode", if on { "SAR only" } else { "normal" });
      return Ok(());
    }
    let cmd = on_off(on);
    info!("touchkey: {} mode, cmd {:#04x}", if on { "SAR only" } else { "normal" }, cmd);

    let mut retries = MODE_CHANGE_RETRIES;
    let readback = loop {
      for attempt in 1..=MODE_WRITE_ATTEMPTS {
        if self.bus.write(Reg::SarMode, cmd).await.is_ok() {
          break;
        }
        warn!("touchkey: SAR mode write failed, attempt {}", attempt);
        self.sleep_ms(timing::SAR_MODE_RETRY_MS).await;
      }
      self.sleep_ms(timing::SAR_MODE_SETTLE_MS).await;

      let readback = self.bus.read_u8(Reg::SarMode).await;
      if matches!(readback, Ok(v) if v == cmd) || retries == 0 {
        break readback;
      }
      warn!("touchkey: SAR mode change not applied, retrying");
      retries -= 1;
      if retries == 0 {
        let mask = self.mask_interrupt().await;
        if self.reset(&mask).await.is_err() {
          error!("touchkey: reset for SAR mode failed");
        }
      }
    }?;

    match readback {
      CMD_ON => self.with_state(|s| s.modes.sar_mode = true),
      CMD_OFF => self.with_state(|s| s.modes.sar_mode = false),
      _ => {}
    }
    if readback == cmd {
      Ok(())
    } else {
      error!("touchkey: SAR mode stuck at {:#04x}", readback);
      Err(Error::Protocol(readback))
    }
  }

  /// Grip press threshold. Negative values clamp to 0; values beyond 16 bits
  /// keep their low 16 bits.
  pub async fn set_grip_press_threshold(&self, threshold: i32) -> Result<(), Error<E>> {
    self.write_threshold(Reg::SarThreshold.offset(0), threshold).await
  }

  /// Grip release threshold, clamped like the press threshold.
  pub async fn set_grip_release_threshold(&self, threshold: i32) -> Result<(), Error<E>> {
    self.write_threshold(Reg::SarThreshold.offset(2), threshold).await
  }

  async fn write_threshold(&self, reg: u8, threshold: i32) -> Result<(), Error<E>> {
    let [hi, lo] = (threshold.max(0) as u16).to_be_bytes();
    debug!("touchkey: threshold {} -> {:#06x} at {:#04x}", threshold, u16::from_be_bytes([hi, lo]), reg);
    self.bus.write(reg, hi).await?;
    self.bus.write(reg + 1, lo).await
  }
}
