use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info};

use super::on_off;
use crate::power::Power;
use crate::{Error, KeySink, Reg, Touchkey};
use crate::{CMD_TA_CONNECTED, CMD_TA_DISCONNECTED};

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  /// Raise sensitivity for gloved fingers.
  ///
  /// Rejected while the device is disabled; the cached mode only changes once
  /// the device accepted it.
  pub async fn set_glove(&self, on: bool) -> Result<(), Error<E>> {
    if !self.is_enabled() {
      return Err(Error::Disabled);
    }
    if self.modes().glove == on {
      debug!("touchkey: glove mode already {}", on);
      return Ok(());
    }
    self.bus.write(Reg::ModeControl, on_off(on)).await?;
    self.with_state(|s| s.modes.glove = on);
    Ok(())
  }

  /// Mobile keyboard cover attached. Shares the glove mode register.
  ///
  /// The cached mode always follows the request, so a disabled device picks
  /// it up on the next restore.
  pub async fn set_keyboard(&self, on: bool) -> Result<(), Error<E>> {
    let previous = self.with_state(|s| core::mem::replace(&mut s.modes.keyboard, on));
    if !self.is_enabled() || previous == on {
      return Ok(());
    }
    self.bus.write(Reg::ModeControl, on_off(on)).await
  }

  /// Flip cover closed.
  ///
  /// Grip builds reboot the controller into SAR-only sensing while the cover
  /// is closed. Otherwise the command goes to the glove register when glove
  /// mode is active, to the flip register if not.
  pub async fn set_flip(&self, on: bool) -> Result<(), Error<E>> {
    let glove = self.with_state(|s| {
      s.modes.flip = on;
      s.modes.glove
    });
    if !self.is_enabled() {
      return Ok(());
    }
    info!("touchkey: flip cover {}", if on { "closed" } else { "open" });

    if self.config.grip {
      if on && self.software_reset().await.is_err() {
        error!("touchkey: software reset for flip cover failed");
      }
      return self.set_sar_only_mode(on).await;
    }

    let reg = if glove { Reg::ModeControl } else { Reg::Flip };
    self.bus.write(reg, on_off(on)).await
  }

  /// Whether a charger is currently attached, as last notified.
  pub fn charger_connected(&self) -> bool {
    self.charger_connected.load(Ordering::Acquire)
  }

  /// Charger (TA) attach/detach notification.
  pub async fn charger_notify(&self, connected: bool) {
    info!("touchkey: charger {}", if connected { "attached" } else { "detached" });
    self.charger_connected.store(connected, Ordering::Release);
    if self.config.ta_notifier {
      self.send_charger_status().await;
    }
  }

  /// Tell the device about the charger and reboot it so the new noise
  /// settings take effect. Returns once the device has booted.
  pub(crate) async fn send_charger_status(&self) {
    if !self.is_enabled() {
      debug!("touchkey: charger status skipped, device off");
      return;
    }
    let cmd = if self.charger_connected() { CMD_TA_CONNECTED } else { CMD_TA_DISCONNECTED };
    if self.bus.write(Reg::ModeControl, cmd).await.is_err() {
      error!("touchkey: charger status write failed");
    }
    if self.software_reset().await.is_err() {
      error!("touchkey: software reset after charger status failed");
    }
  }
}
