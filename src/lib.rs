#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Async, `no_std` driver for the ABOV A96T316 / FT1804 capacitive touchkey
//! controller.
//!
//! The controller sits on an I²C bus, raises an interrupt line on every key
//! edge and keeps its firmware in on-chip flash. This crate covers:
//!
//! - A retrying, lock-serialized register transport shared between the
//!   interrupt task and control callers
//! - Decoding the edge-encoded button status into key press/release events
//! - Loading firmware images from a bundled resource or external storage and
//!   reflashing them through the bootloader handshake, with checksum and
//!   version verification
//! - Glove, keyboard-cover, flip-cover, LED and grip (SAR) controls, with the
//!   cached mode state replayed after every power cycle
//! - Diagnostic readings (key strength, raw counts, grip thresholds)
//!
//! ```no_run
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embedded_hal_async::{delay::DelayNs, digital::Wait, i2c::I2c};
//! use abov_touchkey::{KeySink, Power, Touchkey};
//!
//! async fn run<I, D, P, K, INT>(tk: &Touchkey<CriticalSectionRawMutex, I, D, P, K>, int: &mut INT)
//! where
//!   I: I2c,
//!   D: DelayNs + Clone,
//!   P: Power,
//!   K: KeySink,
//!   INT: Wait,
//! {
//!   loop {
//!     if int.wait_for_falling_edge().await.is_err() {
//!       return;
//!     }
//!     tk.handle_interrupt().await;
//!   }
//! }
//! ```
mod config;
mod control;
mod diag;
mod event;
mod firmware;
mod lifecycle;
#[cfg(test)]
mod mock;
mod power;
mod reg;
mod rw;

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as StateMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::error;

pub use config::*;
pub use control::{ModeState, SarEnable};
pub use diag::{GripStats, GripThresholds, KeyCounters, KeyReadings};
pub use event::{ButtonStatus, Key, KeySink};
pub use firmware::*;
pub use power::Power;
use power::PowerSwitch;
use reg::*;
use rw::Transport;

/// Errors that can occur while interacting with the controller.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
  /// I²C transaction still failing after the transport's retry budget.
  Bus(E),
  /// The bootloader answered the handshake with an unexpected byte.
  Protocol(u8),
  /// A firmware block frame was not accepted by the device.
  Write { address: u16 },
  /// Device checksum after programming differs from the image header.
  ChecksumMismatch { expected: Checksum, actual: Checksum },
  /// Firmware version read back after programming is not the expected one.
  VersionMismatch { expected: u8, actual: u8 },
  /// Update trigger command not recognised.
  InvalidCommand(u8),
  /// The firmware image could not be loaded.
  Resource(ResourceError),
  /// Reflashing failed on every attempt.
  Flash,
  /// The power collaborator refused a power transition.
  Power,
  /// The device is disabled (suspended, resetting or being flashed).
  Disabled,
}

impl<E> Error<E> {
  /// Short name of the failure for logs; the bus error itself need not be
  /// printable.
  pub(crate) fn kind(&self) -> &'static str {
    match self {
      Error::Bus(_) => "bus",
      Error::Protocol(_) => "protocol",
      Error::Write { .. } => "block write",
      Error::ChecksumMismatch { .. } => "checksum",
      Error::VersionMismatch { .. } => "version",
      Error::InvalidCommand(_) => "invalid command",
      Error::Resource(_) => "resource",
      Error::Flash => "flash",
      Error::Power => "power",
      Error::Disabled => "disabled",
    }
  }
}

impl<E> From<ResourceError> for Error<E> {
  fn from(e: ResourceError) -> Self {
    Error::Resource(e)
  }
}

/// Driver-side mirror of device and diagnostic state, updated atomically as
/// a whole.
#[derive(Debug, Clone, Copy, Default)]
struct State {
  modes: ModeState,
  /// Keys reported pressed and not yet released, indexed by [`Key`].
  pressed: [bool; 3],
  led_reserved: bool,
  panel_version: u8,
  image_version: u8,
  update: UpdateStatus,
  counters: KeyCounters,
  grip: GripStats,
}

/// Held while the interrupt handler is masked.
///
/// Obtained from [`Touchkey::mask_interrupt`]; the interrupt handler takes
/// the same lock for every interrupt it services, so no status read can
/// interleave with work done under the mask.
pub struct IrqMask<'a, M: RawMutex>(#[allow(dead_code)] MutexGuard<'a, M, ()>);

/// Driver handle for one touchkey controller.
///
/// Every method takes `&self`, so a single handle (typically placed in a
/// `static`) is shared by the interrupt task and any number of control
/// callers. Bus transactions serialize through the transport lock, cached
/// state through short critical sections.
pub struct Touchkey<M: RawMutex, I, D, P, K> {
  bus: Transport<M, I, D>,
  delay: D,
  power: Mutex<M, PowerSwitch<P>>,
  keys: StateMutex<M, RefCell<K>>,
  irq: Mutex<M, ()>,
  enabled: AtomicBool,
  charger_connected: AtomicBool,
  state: StateMutex<M, Cell<State>>,
  config: Config,
}

impl<M, I, E, D, P, K> Touchkey<M, I, D, P, K>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs + Clone,
  P: Power,
  K: KeySink,
{
  /// Create a driver instance for an already powered controller.
  ///
  /// Nothing is sent on the bus until [`Touchkey::attach`] or another
  /// operation is called.
  pub fn new(i2c: I, delay: D, power: P, keys: K, config: Config) -> Self {
    Self {
      bus: Transport::new(i2c, delay.clone(), config.address),
      delay,
      power: Mutex::new(PowerSwitch::new(power, true)),
      keys: StateMutex::new(RefCell::new(keys)),
      irq: Mutex::new(()),
      enabled: AtomicBool::new(true),
      charger_connected: AtomicBool::new(false),
      state: StateMutex::new(Cell::new(State::default())),
      config,
    }
  }

  /// The configuration this handle was built with.
  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Whether the device currently accepts commands and interrupts.
  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::Acquire)
  }

  /// Snapshot of the cached device mode flags.
  pub fn modes(&self) -> ModeState {
    self.state().modes
  }

  /// Mask the interrupt handler until the returned token is dropped.
  ///
  /// Waits for an interrupt being serviced to finish first.
  pub async fn mask_interrupt(&self) -> IrqMask<'_, M> {
    IrqMask(self.irq.lock().await)
  }

  fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::Release);
  }

  fn state(&self) -> State {
    self.state.lock(|s| s.get())
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
    self.state.lock(|cell| {
      let mut state = cell.get();
      let ret = f(&mut state);
      cell.set(state);
      ret
    })
  }

  fn with_keys(&self, f: impl FnOnce(&mut K)) {
    self.keys.lock(|keys| f(&mut keys.borrow_mut()));
  }

  async fn sleep_ms(&self, ms: u32) {
    self.delay.clone().delay_ms(ms).await;
  }

  async fn sleep_us(&self, us: u32) {
    self.delay.clone().delay_us(us).await;
  }

  async fn set_power(&self, on: bool) -> Result<(), Error<E>> {
    self.power.lock().await.set(on).await.map_err(|e| {
      error!("touchkey: power {} failed: {:?}", if on { "on" } else { "off" }, e);
      Error::Power
    })
  }

  /// Full power cycle: off, settle, on. The caller waits for boot.
  async fn power_cycle(&self) -> Result<(), Error<E>> {
    self.set_power(false).await?;
    self.sleep_ms(timing::POWER_OFF_MS).await;
    self.set_power(true).await
  }
}
