use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::{debug, error, info, warn};

use crate::power::Power;
use crate::reg::timing::BUS_RETRY_MS;
use crate::{Error, Reg, Touchkey};

mod status;

pub use status::ButtonStatus;
use status::PRESSED;

/// Status read attempts per interrupt before the device is reset.
const STATUS_ATTEMPTS: u8 = 3;

/// Keys reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Key {
  Recent,
  Back,
  /// Grip (SAR proximity) sensor, reported as a key on grip builds.
  Grip,
}

impl Key {
  pub(crate) const ALL: [Key; 3] = [Key::Recent, Key::Back, Key::Grip];
}

/// Receiver of key events, usually an input device of the host.
pub trait KeySink {
  fn report(&mut self, key: Key, pressed: bool);

  /// Marks the end of one batch of reports.
  fn sync(&mut self);
}

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  /// Service interrupts from `int` forever, returning only when waiting on
  /// the line fails.
  pub async fn service_interrupts<W: Wait>(&self, int: &mut W) -> Result<(), W::Error> {
    loop {
      int.wait_for_falling_edge().await?;
      self.handle_interrupt().await;
    }
  }

  /// Handle one interrupt: read the status, report the key edges it carries.
  ///
  /// A device that does not answer the status read is reset instead, and no
  /// keys are reported for this interrupt.
  pub async fn handle_interrupt(&self) {
    let mask = self.mask_interrupt().await;
    if !self.is_enabled() {
      debug!("touchkey: interrupt while disabled");
      return;
    }

    let status = match self.read_status().await {
      Ok(status) => status,
      Err(_) => {
        error!("touchkey: status unreadable, resetting device");
        if self.reset(&mask).await.is_err() {
          error!("touchkey: reset after status failure failed");
        }
        return;
      }
    };
    if status.is_empty() {
      debug!("touchkey: empty status");
      return;
    }

    let grip = self.config.grip;
    let mut reported = false;
    for key in Key::ALL {
      if key == Key::Grip && !grip {
        continue;
      }
      if let Some(pressed) = status.edge(key) {
        info!("touchkey: {:?} {}", key, if pressed { "P" } else { "R" });
        self.report(key, pressed);
        reported = true;
      }
    }
    if reported {
      self.with_keys(|keys| keys.sync());
    }

    self.count_press(status);

    if grip {
      if let Some(pressed) = status.edge(Key::Grip) {
        self.record_grip_event(pressed).await;
      }
    }
  }

  async fn read_status(&self) -> Result<ButtonStatus, Error<E>> {
    let mut attempt = 1;
    loop {
      match self.bus.read_u8(Reg::ButtonStatusNew).await {
        Ok(bits) => return Ok(ButtonStatus::from(bits)),
        Err(_) if attempt < STATUS_ATTEMPTS => {
          warn!("touchkey: status read failed, attempt {}", attempt);
          self.sleep_ms(BUS_RETRY_MS).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }

  fn report(&self, key: Key, pressed: bool) {
    self.with_keys(|keys| keys.report(key, pressed));
    self.with_state(|s| s.pressed[key as usize] = pressed);
  }

  /// Release every key believed pressed, then sync once.
  pub(crate) fn release_all(&self) {
    let mut released = false;
    for key in Key::ALL {
      if self.state().pressed[key as usize] {
        self.report(key, false);
        released = true;
      }
    }
    if released {
      self.with_keys(|keys| keys.sync());
    }
  }

  /// Release only the grip key, when it is held.
  pub(crate) fn release_grip(&self) {
    if self.state().pressed[Key::Grip as usize] {
      self.report(Key::Grip, false);
      self.with_keys(|keys| keys.sync());
    }
  }

  fn count_press(&self, status: ButtonStatus) {
    self.with_state(|s| {
      if !s.counters.enabled {
        return;
      }
      if status.recent() == PRESSED {
        s.counters.recent += 1;
      } else if status.back() == PRESSED {
        s.counters.back += 1;
      }
    });
  }

  async fn record_grip_event(&self, pressed: bool) {
    let abnormal = self.with_state(|s| {
      s.grip.last_event = pressed;
      s.grip.abnormal_mode
    });
    if !(abnormal && pressed) {
      return;
    }
    match self.grip_diff().await {
      Ok(diff) => self.with_state(|s| {
        s.grip.max_diff = s.grip.max_diff.max(diff);
        s.grip.irq_count += 1;
      }),
      Err(_) => error!("touchkey: grip diff read failed"),
    }
  }
}
