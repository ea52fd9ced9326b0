use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info, warn};

use crate::power::Power;
use crate::{timing, BundledFirmware, Error, ExternalStorage, FirmwareProviders, KeySink, Reg, Touchkey};
use crate::{UpdateStatus, CMD_LED_OFF};

/// Firmware versions from this one up are test builds.
const TEST_FIRMWARE_VERSION: u8 = 0xD0;

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  /// Bring the controller up: check its firmware against the bundled image,
  /// reflash it when needed and return the running firmware version.
  ///
  /// Fails when the bundled image cannot be loaded or reflashing fails.
  pub async fn attach<B, S>(&self, providers: &FirmwareProviders<B, S>) -> Result<u8, Error<E>>
  where
    B: BundledFirmware,
    S: ExternalStorage,
  {
    info!("touchkey: attach {}", self.config.chip.name());

    let image = providers.load_bundled(self.config.firmware_name)?;
    self.with_state(|s| s.image_version = image.version());

    let version = self.read_firmware_version().await.unwrap_or_else(|_| {
      warn!("touchkey: firmware version unreadable");
      0
    });
    let model = self.model_number().await.ok();
    info!(
      "touchkey: device firmware {:#04x} model {:?}, image {:#04x} model {:#04x}",
      version,
      model,
      image.version(),
      image.model_number()
    );

    let model_mismatch = model != Some(image.model_number());
    let stale = version == 0
      || version < image.version()
      || (self.config.update_test_firmware && version >= TEST_FIRMWARE_VERSION);
    let update = model_mismatch || (stale && !self.config.bringup);
    if update {
      info!("touchkey: firmware update needed");
      self.with_state(|s| s.update = UpdateStatus::Downloading);
      let mask = self.mask_interrupt().await;
      self.set_enabled(false);
      let result = self.flash(&mask, &image).await;
      self.set_enabled(true);
      drop(mask);

      let status = if result.is_ok() { UpdateStatus::Pass } else { UpdateStatus::Fail };
      self.with_state(|s| s.update = status);
      if let Err(e) = result {
        error!("touchkey: boot time update failed");
        return Err(e);
      }
    }

    if self.config.grip {
      self.with_state(|s| s.modes.sar_sensing = true);
    }

    let version = self.firmware_version().await;
    info!("touchkey: attached, firmware {:#04x}", version);
    Ok(version)
  }

  /// Input device closed: stop sensing.
  ///
  /// Grip builds keep the controller powered for proximity sensing and only
  /// switch it to SAR-only mode.
  pub async fn stop(&self) -> Result<(), Error<E>> {
    if self.config.grip {
      return self.set_sar_only_mode(true).await;
    }
    if !self.is_enabled() {
      debug!("touchkey: already stopped");
      return Ok(());
    }
    let _mask = self.mask_interrupt().await;
    self.set_enabled(false);
    self.release_all();
    self.set_power(false).await?;
    info!("touchkey: stopped");
    Ok(())
  }

  /// Input device opened: power the controller back up and restore its
  /// settings.
  pub async fn start(&self) -> Result<(), Error<E>> {
    if self.config.grip {
      return self.set_sar_only_mode(self.modes().flip).await;
    }
    if self.is_enabled() {
      debug!("touchkey: already started");
      return Ok(());
    }
    self.set_power(true).await?;
    self.sleep_ms(timing::RESET_DELAY_MS).await;
    self.set_enabled(true);

    self.replay_led().await;
    if self.config.ta_notifier && self.charger_connected() {
      self.send_charger_status().await;
    }
    self.restore_modes().await;
    info!("touchkey: started");
    Ok(())
  }

  /// Host shutdown: LED off, power off. The device stays disabled.
  pub async fn shutdown(&self) -> Result<(), Error<E>> {
    let _mask = self.mask_interrupt().await;
    if self.is_enabled() && self.config.led && self.bus.write(Reg::ButtonStatus, CMD_LED_OFF).await.is_err() {
      error!("touchkey: LED off at shutdown failed");
    }
    let result = self.set_power(false).await;
    self.set_enabled(false);
    info!("touchkey: shutdown");
    result
  }
}
