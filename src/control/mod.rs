use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info, warn};

use crate::power::Power;
use crate::{timing, Error, IrqMask, KeySink, Reg, Touchkey};
use crate::{CMD_LED_OFF, CMD_LED_ON, CMD_OFF, CMD_ON, CMD_SW_RESET};

mod modes;
mod sar;

pub use sar::SarEnable;

/// Reset-and-reread rounds when the firmware version cannot be read.
const VERSION_RESET_ROUNDS: u8 = 3;

/// Driver-side belief of the device modes. The device forgets all of them on
/// a power cycle, so they are written back after every reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModeState {
  pub glove: bool,
  pub keyboard: bool,
  pub flip: bool,
  /// Grip only sensing (SAR-only mode).
  pub sar_mode: bool,
  pub sar_enabled: bool,
  /// Set by [`SarEnable::ForceOff`]; later enable requests are cached only.
  pub sar_force_off: bool,
  pub sar_sensing: bool,
  /// Last LED command, applied or reserved.
  pub led_on: bool,
}

impl Default for ModeState {
  fn default() -> Self {
    Self {
      glove: false,
      keyboard: false,
      flip: false,
      sar_mode: false,
      sar_enabled: false,
      sar_force_off: false,
      sar_sensing: true,
      led_on: false,
    }
  }
}

pub(crate) const fn on_off(on: bool) -> u8 {
  if on {
    CMD_ON
  } else {
    CMD_OFF
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
  /// Firmware version reported by the device, with no recovery on failure.
  pub async fn read_firmware_version(&self) -> Result<u8, Error<E>> {
    let version = self.bus.read_u8(Reg::FirmwareVersion).await?;
    self.with_state(|s| s.panel_version = version);
    Ok(version)
  }

  /// Firmware version of the device, resetting it between re-reads when it
  /// does not answer. Reports 0 when every round fails.
  pub async fn firmware_version(&self) -> u8 {
    if let Ok(version) = self.read_firmware_version().await {
      return version;
    }
    for round in 1..=VERSION_RESET_ROUNDS {
      warn!("touchkey: firmware version unreadable, reset round {}", round);
      {
        let mask = self.mask_interrupt().await;
        if self.reset(&mask).await.is_err() {
          error!("touchkey: reset failed");
        }
      }
      if let Ok(version) = self.read_firmware_version().await {
        return version;
      }
    }
    error!("touchkey: firmware version read failed");
    self.with_state(|s| s.panel_version = 0);
    0
  }

  pub async fn model_number(&self) -> Result<u8, Error<E>> {
    self.bus.read_u8(Reg::ModelNumber).await
  }

  pub async fn vendor_id(&self) -> Result<u8, Error<E>> {
    self.bus.read_u8(Reg::VendorId).await
  }

  /// Key touch threshold.
  pub async fn threshold(&self) -> Result<u8, Error<E>> {
    self.bus.read_u8(Reg::Threshold).await
  }

  /// Reboot the controller firmware and wait for it to boot again.
  pub async fn software_reset(&self) -> Result<(), Error<E>> {
    self.bus.write(Reg::SwReset, CMD_SW_RESET).await?;
    self.sleep_ms(timing::BOOT_DELAY_MS).await;
    Ok(())
  }

  /// Switch the key backlight.
  ///
  /// A command that cannot be applied (device disabled or write failure) is
  /// kept and replayed on the next resume if it turns the LED on. Boards
  /// without a controller-driven LED ignore the call.
  pub async fn set_led(&self, on: bool) -> Result<(), Error<E>> {
    if !self.config.led {
      debug!("touchkey: no LED, ignoring");
      return Ok(());
    }
    self.with_state(|s| s.modes.led_on = on);
    if !self.is_enabled() {
      self.with_state(|s| s.led_reserved = true);
      return Err(Error::Disabled);
    }
    let cmd = if on { CMD_LED_ON } else { CMD_LED_OFF };
    if let Err(e) = self.bus.write(Reg::ButtonStatus, cmd).await {
      error!("touchkey: LED {} failed", if on { "on" } else { "off" });
      self.with_state(|s| s.led_reserved = true);
      return Err(e);
    }
    self.sleep_ms(timing::LED_SETTLE_MS).await;
    self.with_state(|s| s.led_reserved = false);
    debug!("touchkey: LED {}", if on { "on" } else { "off" });
    Ok(())
  }

  /// Replay a reserved LED-on command.
  pub(crate) async fn replay_led(&self) {
    let replay = self.with_state(|s| {
      let replay = s.led_reserved && s.modes.led_on;
      if replay {
        s.led_reserved = false;
      }
      replay
    });
    if replay {
      debug!("touchkey: LED reserved on");
      if self.bus.write(Reg::ButtonStatus, CMD_LED_ON).await.is_err() {
        error!("touchkey: reserved LED replay failed");
      }
    }
  }

  /// Write the cached cover and glove modes back to the device. Flip cover
  /// takes precedence over glove mode; keyboard mode is independent.
  pub(crate) async fn restore_modes(&self) {
    let modes = self.modes();
    let cover = if modes.flip {
      Some((Reg::Flip, "flip"))
    } else if modes.glove {
      Some((Reg::ModeControl, "glove"))
    } else {
      None
    };
    if let Some((reg, name)) = cover {
      if self.bus.write(reg, CMD_ON).await.is_err() {
        error!("touchkey: restoring {} mode failed", name);
      }
    }
    if modes.keyboard && self.bus.write(Reg::ModeControl, CMD_ON).await.is_err() {
      error!("touchkey: restoring keyboard mode failed");
    }
  }

  /// Recover an unresponsive device: release held keys, power cycle it and
  /// write every cached setting back.
  ///
  /// Does nothing while the device is disabled, since whoever disabled it
  /// owns its power state.
  pub async fn reset(&self, _mask: &IrqMask<'_, M>) -> Result<(), Error<E>> {
    if !self.is_enabled() {
      return Ok(());
    }
    info!("touchkey: reset start");
    self.set_enabled(false);
    self.release_all();

    let cycled = self.power_cycle().await;
    self.sleep_ms(timing::RESET_DELAY_MS).await;

    if let Some(level) = self.config.light_reg {
      if self.bus.write(Reg::LedBack, level).await.is_err() {
        error!("touchkey: back LED dimming write failed");
      }
      if self.bus.write(Reg::LedRecent, level).await.is_err() {
        error!("touchkey: recent LED dimming write failed");
      }
    }

    let modes = self.modes();
    if self.config.grip {
      if modes.sar_enabled && self.bus.write(Reg::SarEnable, CMD_ON).await.is_err() {
        error!("touchkey: restoring grip enable failed");
      }
      if !modes.sar_sensing {
        self.write_sar_sensing(false).await;
      }
    }
    if self.config.ta_notifier && self.charger_connected() {
      self.send_charger_status().await;
    }
    self.restore_modes().await;

    self.set_enabled(true);
    info!("touchkey: reset end");
    cycled
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mock::{block_on, Sim};
  use crate::Config;

  #[test]
  fn version_read_falls_back_to_reset() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());
    sim.set_reg(0x01, 0x17);
    // The first read loses its address phase three times.
    sim.fail_next(3);

    assert_eq!(block_on(tk.firmware_version()), 0x17);
    assert_eq!(sim.power_off_calls(), 1);
  }

  #[test]
  fn unreadable_version_reports_zero() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());
    sim.set_offline(true);

    assert_eq!(block_on(tk.firmware_version()), 0);
    assert_eq!(sim.power_off_calls(), 3);
  }

  #[test]
  fn led_waits_after_success() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default().with_led(true));

    block_on(tk.set_led(true)).unwrap();
    assert_eq!(sim.writes_to(0x00), [CMD_LED_ON]);
    assert_eq!(sim.slept_ms(), timing::LED_SETTLE_MS as u64);
  }

  #[test]
  fn led_needs_led_board() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());

    block_on(tk.set_led(true)).unwrap();
    assert!(sim.writes().is_empty());
    assert!(!tk.modes().led_on);

    tk.set_enabled(false);
    block_on(tk.set_led(true)).unwrap();
    block_on(tk.replay_led());
    assert!(sim.writes().is_empty());
  }

  #[test]
  fn led_is_reserved_while_disabled() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default().with_led(true));
    tk.set_enabled(false);

    assert!(matches!(block_on(tk.set_led(true)), Err(Error::Disabled)));
    assert!(sim.writes().is_empty());

    block_on(tk.replay_led());
    assert_eq!(sim.writes_to(0x00), [CMD_LED_ON]);
    // Replayed once only.
    block_on(tk.replay_led());
    assert_eq!(sim.writes_to(0x00).len(), 1);
  }

  #[test]
  fn reserved_led_off_is_not_replayed() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default().with_led(true));
    sim.fail_next(3);

    assert!(block_on(tk.set_led(false)).is_err());
    block_on(tk.replay_led());
    assert!(sim.writes().is_empty());
  }

  #[test]
  fn software_reset_waits_for_boot() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());

    block_on(tk.software_reset()).unwrap();
    assert_eq!(sim.writes(), [(0x1A, CMD_SW_RESET)]);
    assert_eq!(sim.slept_ms(), timing::BOOT_DELAY_MS as u64);
  }

  #[test]
  fn flip_takes_precedence_over_glove() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());
    tk.with_state(|s| {
      s.modes.glove = true;
      s.modes.flip = true;
      s.modes.keyboard = true;
    });

    block_on(tk.restore_modes());
    assert_eq!(sim.writes(), [(0x15, CMD_ON), (0x13, CMD_ON)]);
  }

  #[test]
  fn reset_replays_cached_state() {
    let sim = Sim::new();
    let config = Config::default().with_light_reg(Some(0x0C)).with_ta_notifier(true);
    let tk = sim.touchkey(config);
    tk.with_state(|s| s.modes.glove = true);
    block_on(tk.charger_notify(true));
    sim.clear_writes();
    let before = sim.slept_ms();

    let mask = block_on(tk.mask_interrupt());
    block_on(tk.reset(&mask)).unwrap();
    assert_eq!(
      sim.writes(),
      [(0x09, 0x0C), (0x08, 0x0C), (0x13, 0x10), (0x1A, CMD_SW_RESET), (0x13, CMD_ON)]
    );
    // The modes go out only after the software reset has booted.
    let waited = timing::POWER_OFF_MS + timing::RESET_DELAY_MS + timing::BOOT_DELAY_MS;
    assert_eq!(sim.slept_ms() - before, waited as u64);
    assert!(tk.is_enabled());
  }

  #[test]
  fn reset_restores_grip_settings() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default().with_grip(true));
    tk.with_state(|s| {
      s.modes.sar_enabled = true;
      s.modes.sar_sensing = false;
    });

    let mask = block_on(tk.mask_interrupt());
    block_on(tk.reset(&mask)).unwrap();
    assert_eq!(sim.writes(), [(0x24, CMD_ON), (0x25, CMD_OFF)]);
  }

  #[test]
  fn reset_is_skipped_while_disabled() {
    let sim = Sim::new();
    let tk = sim.touchkey(Config::default());
    tk.set_enabled(false);

    let mask = block_on(tk.mask_interrupt());
    block_on(tk.reset(&mask)).unwrap();
    assert_eq!(sim.power_off_calls(), 0);
    assert!(!tk.is_enabled());
  }
}
