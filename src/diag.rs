use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{debug, error, info};

use crate::power::Power;
use crate::{timing, Error, KeySink, Reg, Touchkey, CMD_TOTAL_CAP_TRIGGER};

/// Per-key reading, recent key first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyReadings {
  pub recent: u16,
  pub back: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GripThresholds {
  pub press: u16,
  pub release: u16,
  pub noise: u16,
}

/// Press counts per key, taken by the interrupt handler while enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyCounters {
  pub enabled: bool,
  pub recent: u32,
  pub back: u32,
}

/// Grip tracking for abnormal-mode (grip sensor calibration) checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GripStats {
  /// Last grip edge reported, `true` for pressed.
  pub last_event: bool,
  pub abnormal_mode: bool,
  /// Grip presses seen in abnormal mode.
  pub irq_count: u32,
  /// Largest diff sampled on a grip press.
  pub max_diff: i16,
  /// Largest diff sampled by the periodic monitor.
  pub max_normal_diff: i16,
}

impl GripStats {
  /// `(result, irq_count, diff)`: result is -1 once a grip interrupt fired,
  /// diff the press maximum in that case and the idle maximum otherwise.
  pub fn summary(&self) -> (i32, u32, i16) {
    if self.irq_count > 0 {
      (-1, self.irq_count, self.max_diff)
    } else {
      (0, 0, self.max_normal_diff)
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
  /// Touch strength (diff counts) per key.
  pub async fn key_strength(&self) -> Result<KeyReadings, Error<E>> {
    let (recent, back) = self.bus.read_u16_pair(Reg::DiffData).await?;
    Ok(KeyReadings { recent, back })
  }

  pub async fn key_raw(&self) -> Result<KeyReadings, Error<E>> {
    let (recent, back) = self.bus.read_u16_pair(Reg::RawData).await?;
    Ok(KeyReadings { recent, back })
  }

  pub async fn grip_thresholds(&self) -> Result<GripThresholds, Error<E>> {
    let (press, release) = self.bus.read_u16_pair(Reg::SarThreshold).await?;
    let noise = self.bus.read_u16(Reg::SarNoiseThreshold).await?;
    Ok(GripThresholds { press, release, noise })
  }

  /// Total grip capacitance, in units of 100 counts.
  pub async fn grip_total_cap(&self) -> Result<u16, Error<E>> {
    if self.bus.write(Reg::SarTotalCap, CMD_TOTAL_CAP_TRIGGER).await.is_err() {
      error!("touchkey: total cap trigger failed");
    }
    self.sleep_us(timing::TOTAL_CAP_US).await;
    Ok(self.bus.read_u16(Reg::SarTotalCapRead).await? / 100)
  }

  /// Grip diff counts of both channels.
  pub async fn grip_strength(&self) -> Result<(u16, u16), Error<E>> {
    self.bus.read_u16_pair(Reg::SarDiffData).await
  }

  /// Signed diff of the first grip channel.
  pub async fn grip_diff(&self) -> Result<i16, Error<E>> {
    let diff = self.bus.read_u16(Reg::SarDiffData).await? as i16;
    debug!("touchkey: grip diff {}", diff);
    Ok(diff)
  }

  pub async fn grip_baseline(&self) -> Result<u16, Error<E>> {
    self.bus.read_u16(Reg::SarBaseline).await
  }

  /// Raw grip counts. Only the first channel is wired; the second reads 0.
  pub async fn grip_raw(&self) -> Result<(u16, u16), Error<E>> {
    let (raw, _) = self.bus.read_u16_pair(Reg::SarRawData).await?;
    Ok((raw, 0))
  }

  /// Whether the grip sensor was last reported pressed.
  pub fn grip_event(&self) -> bool {
    self.state().grip.last_event
  }

  pub fn chip_name(&self) -> &'static str {
    self.config.chip.name()
  }

  /// Version of the most recently loaded firmware image.
  pub fn image_version(&self) -> u8 {
    self.state().image_version
  }

  /// Firmware version the device reported last.
  pub fn panel_version(&self) -> u8 {
    self.state().panel_version
  }

  /// Start counting key presses from zero, or stop counting.
  pub fn set_key_counting(&self, on: bool) {
    self.with_state(|s| {
      if on {
        s.counters = KeyCounters { enabled: true, ..KeyCounters::default() };
      } else {
        s.counters.enabled = false;
      }
    });
    info!("touchkey: key counting {}", on);
  }

  pub fn key_counters(&self) -> KeyCounters {
    self.state().counters
  }

  /// Enter grip abnormal mode with cleared statistics, or leave it.
  pub fn set_grip_abnormal_mode(&self, on: bool) {
    self.with_state(|s| {
      s.grip.abnormal_mode = on;
      if on {
        s.grip.irq_count = 0;
        s.grip.max_diff = 0;
        s.grip.max_normal_diff = 0;
      }
    });
    info!("touchkey: grip abnormal mode {}", on);
  }

  pub fn grip_stats(&self) -> GripStats {
    self.state().grip
  }

  /// One grip monitor sample: in abnormal mode with grip enabled, track the
  /// largest idle diff.
  pub async fn grip_monitor_tick(&self) {
    let state = self.state();
    if !(state.grip.abnormal_mode && state.modes.sar_enabled) {
      return;
    }
    match self.grip_diff().await {
      Ok(diff) => self.with_state(|s| s.grip.max_normal_diff = s.grip.max_normal_diff.max(diff)),
      Err(_) => error!("touchkey: grip monitor read failed"),
    }
  }

  /// Periodic grip monitor. Runs forever; spawn it next to the interrupt
  /// task on grip builds.
  pub async fn run_grip_monitor(&self) {
    loop {
      self.sleep_ms(timing::GRIP_MONITOR_MS).await;
      self.grip_monitor_tick().await;
    }
  }
}
