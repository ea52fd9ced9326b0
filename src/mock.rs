//! Simulated controller for unit tests: a register file in normal mode, the
//! bootloader framing in flash mode, injectable bus failures and a power
//! switch that wipes volatile state.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation, SevenBitAddress};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

pub(crate) use embassy_futures::block_on;
use embassy_futures::yield_now;

use crate::{BundledFirmware, Config, ExternalStorage, Key, KeySink, Power, Touchkey};

pub(crate) type TestTouchkey = Touchkey<NoopRawMutex, SimBus, SimDelay, SimPower, SimKeys>;

/// Registers the device clears on every power cycle.
const VOLATILE_REGS: [u8; 6] = [0x08, 0x09, 0x13, 0x15, 0x24, 0x25];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
  Normal,
  Boot,
  Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootRead {
  ModeId,
  Busy(u32),
  Checksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyEvent {
  Report(Key, bool),
  Sync,
}

struct SimState {
  powered: bool,
  mode: Mode,
  pointer: u8,
  regs: [u8; 256],
  failures: VecDeque<bool>,
  offline: bool,
  transactions: usize,
  writes: Vec<(u8, u8)>,
  traffic: Vec<Vec<u8>>,
  frames: Vec<Vec<u8>>,
  boot_read: BootRead,
  mode_id: u8,
  erased: bool,
  blocks: Vec<(u16, Vec<u8>)>,
  busy_reads: u32,
  busy_polls: u32,
  checksums: VecDeque<(u8, u8)>,
  last_checksum: (u8, u8),
  flashed: bool,
  flashed_version: u8,
  power_on_calls: usize,
  power_off_calls: usize,
  slept_ns: u64,
  events: Vec<KeyEvent>,
  sar_mode_sticky: bool,
}

impl SimState {
  fn new() -> Self {
    Self {
      powered: true,
      mode: Mode::Normal,
      pointer: 0,
      regs: [0; 256],
      failures: VecDeque::new(),
      offline: false,
      transactions: 0,
      writes: Vec::new(),
      traffic: Vec::new(),
      frames: Vec::new(),
      boot_read: BootRead::ModeId,
      mode_id: 0x31,
      erased: false,
      blocks: Vec::new(),
      busy_reads: 0,
      busy_polls: 0,
      checksums: VecDeque::new(),
      last_checksum: (0, 0),
      flashed: false,
      flashed_version: 0,
      power_on_calls: 0,
      power_off_calls: 0,
      slept_ns: 0,
      events: Vec::new(),
      sar_mode_sticky: false,
    }
  }

  fn transaction(&mut self, operations: &mut [Operation<'_>]) -> Result<(), SimError> {
    self.transactions += 1;
    let fail = self.failures.pop_front().unwrap_or(false);
    if fail || self.offline || !self.powered || self.mode == Mode::Exited {
      return Err(SimError);
    }
    for op in operations.iter_mut() {
      match op {
        Operation::Write(bytes) => self.on_write(bytes),
        Operation::Read(buf) => self.on_read(buf),
      }
    }
    Ok(())
  }

  fn on_write(&mut self, bytes: &[u8]) {
    self.traffic.push(bytes.to_vec());
    match self.mode {
      Mode::Normal if bytes == [0xAC, 0x5B] => {
        self.frames.push(bytes.to_vec());
        self.mode = Mode::Boot;
        self.boot_read = BootRead::ModeId;
      }
      Mode::Normal => match *bytes {
        [reg] => self.pointer = reg,
        [reg, value] => {
          self.writes.push((reg, value));
          if reg == 0x17 && self.sar_mode_sticky {
            return;
          }
          self.regs[reg as usize] = value;
          if reg == 0x1A && value == 0x10 {
            self.clear_volatile();
          }
        }
        _ => {}
      },
      Mode::Boot => {
        self.frames.push(bytes.to_vec());
        match bytes {
          [0xAC, 0x2D] => self.erased = true,
          [0xAC, 0x7A, hi, lo, data @ ..] => {
            self.blocks.push((u16::from_be_bytes([*hi, *lo]), data.to_vec()));
            self.boot_read = BootRead::Busy(self.busy_reads);
          }
          [0x00] => {
            self.last_checksum = self.checksums.pop_front().unwrap_or(self.last_checksum);
            self.boot_read = BootRead::Checksum;
          }
          [0xAC, 0xE1] => {
            self.mode = Mode::Exited;
            self.flashed = true;
          }
          _ => {}
        }
      }
      Mode::Exited => {}
    }
  }

  fn on_read(&mut self, buf: &mut [u8]) {
    match self.mode {
      Mode::Normal => {
        for (i, b) in buf.iter_mut().enumerate() {
          *b = self.regs[self.pointer.wrapping_add(i as u8) as usize];
        }
      }
      Mode::Boot => match self.boot_read {
        BootRead::ModeId => buf[0] = self.mode_id,
        BootRead::Busy(0) => {
          self.busy_polls += 1;
          buf[0] = 0x00;
        }
        BootRead::Busy(n) => {
          self.busy_polls += 1;
          buf[0] = 0x01;
          self.boot_read = BootRead::Busy(n - 1);
        }
        BootRead::Checksum => {
          buf.fill(0);
          if buf.len() >= 6 {
            buf[4] = self.last_checksum.0;
            buf[5] = self.last_checksum.1;
          }
        }
      },
      Mode::Exited => {}
    }
  }

  fn clear_volatile(&mut self) {
    for reg in VOLATILE_REGS {
      self.regs[reg as usize] = 0;
    }
  }

  fn set_power(&mut self, on: bool) {
    if on {
      self.power_on_calls += 1;
      self.powered = true;
      self.mode = Mode::Normal;
      self.clear_volatile();
      if self.flashed {
        self.regs[0x01] = self.flashed_version;
      }
    } else {
      self.power_off_calls += 1;
      self.powered = false;
    }
  }
}

/// Shared handle on one simulated controller.
#[derive(Clone)]
pub(crate) struct Sim(Rc<RefCell<SimState>>);

impl Sim {
  pub(crate) fn new() -> Self {
    Self(Rc::new(RefCell::new(SimState::new())))
  }

  pub(crate) fn bus(&self) -> SimBus {
    SimBus(self.0.clone())
  }

  pub(crate) fn delay(&self) -> SimDelay {
    SimDelay(self.0.clone())
  }

  pub(crate) fn touchkey(&self, config: Config) -> TestTouchkey {
    Touchkey::new(self.bus(), self.delay(), SimPower(self.0.clone()), SimKeys(self.0.clone()), config)
  }

  pub(crate) fn set_reg(&self, reg: u8, value: u8) {
    self.0.borrow_mut().regs[reg as usize] = value;
  }

  /// Fail the next `n` bus transactions.
  pub(crate) fn fail_next(&self, n: usize) {
    self.0.borrow_mut().failures.extend(core::iter::repeat(true).take(n));
  }

  /// Per-transaction failure script, `true` meaning fail.
  pub(crate) fn fail_pattern(&self, pattern: &[bool]) {
    self.0.borrow_mut().failures.extend(pattern.iter().copied());
  }

  pub(crate) fn set_offline(&self, offline: bool) {
    self.0.borrow_mut().offline = offline;
  }

  pub(crate) fn set_mode_id(&self, id: u8) {
    self.0.borrow_mut().mode_id = id;
  }

  pub(crate) fn set_busy_reads(&self, n: u32) {
    self.0.borrow_mut().busy_reads = n;
  }

  /// Checksums reported by successive readbacks; the last one repeats.
  pub(crate) fn checksums(&self, values: &[(u8, u8)]) {
    self.0.borrow_mut().checksums.extend(values.iter().copied());
  }

  pub(crate) fn set_flashed_version(&self, version: u8) {
    self.0.borrow_mut().flashed_version = version;
  }

  /// Ignore writes to the SAR mode register, as a device stuck in one mode.
  pub(crate) fn set_sar_mode_sticky(&self, sticky: bool) {
    self.0.borrow_mut().sar_mode_sticky = sticky;
  }

  pub(crate) fn transactions(&self) -> usize {
    self.0.borrow().transactions
  }

  pub(crate) fn writes(&self) -> Vec<(u8, u8)> {
    self.0.borrow().writes.clone()
  }

  pub(crate) fn writes_to(&self, reg: u8) -> Vec<u8> {
    self.0.borrow().writes.iter().filter(|(r, _)| *r == reg).map(|(_, v)| *v).collect()
  }

  pub(crate) fn clear_writes(&self) {
    self.0.borrow_mut().writes.clear();
  }

  /// Every written frame in bus order, address selects included.
  pub(crate) fn traffic(&self) -> Vec<Vec<u8>> {
    self.0.borrow().traffic.clone()
  }

  /// Number of bootloader entries, one per programming attempt.
  pub(crate) fn boot_entries(&self) -> usize {
    self.0.borrow().frames.iter().filter(|f| f.as_slice() == [0xAC, 0x5B]).count()
  }

  pub(crate) fn erased(&self) -> bool {
    self.0.borrow().erased
  }

  pub(crate) fn blocks(&self) -> Vec<(u16, Vec<u8>)> {
    self.0.borrow().blocks.clone()
  }

  pub(crate) fn busy_polls(&self) -> u32 {
    self.0.borrow().busy_polls
  }

  pub(crate) fn power_on_calls(&self) -> usize {
    self.0.borrow().power_on_calls
  }

  pub(crate) fn power_off_calls(&self) -> usize {
    self.0.borrow().power_off_calls
  }

  pub(crate) fn slept_ms(&self) -> u64 {
    self.0.borrow().slept_ns / 1_000_000
  }

  pub(crate) fn events(&self) -> Vec<KeyEvent> {
    self.0.borrow().events.clone()
  }

  pub(crate) fn clear_events(&self) {
    self.0.borrow_mut().events.clear();
  }
}

#[derive(Debug)]
pub(crate) struct SimError;

impl embedded_hal::i2c::Error for SimError {
  fn kind(&self) -> ErrorKind {
    ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
  }
}

pub(crate) struct SimBus(Rc<RefCell<SimState>>);

impl ErrorType for SimBus {
  type Error = SimError;
}

impl I2c<SevenBitAddress> for SimBus {
  async fn transaction(&mut self, _address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
    self.0.borrow_mut().transaction(operations)
  }
}

#[derive(Clone)]
pub(crate) struct SimDelay(Rc<RefCell<SimState>>);

impl DelayNs for SimDelay {
  async fn delay_ns(&mut self, ns: u32) {
    self.0.borrow_mut().slept_ns += ns as u64;
    // Let other tasks on the same executor run, as a real timer would.
    yield_now().await;
  }
}

pub(crate) struct SimPower(Rc<RefCell<SimState>>);

impl Power for SimPower {
  type Error = ();

  async fn set_power(&mut self, on: bool) -> Result<(), Self::Error> {
    self.0.borrow_mut().set_power(on);
    Ok(())
  }
}

pub(crate) struct SimKeys(Rc<RefCell<SimState>>);

impl KeySink for SimKeys {
  fn report(&mut self, key: Key, pressed: bool) {
    self.0.borrow_mut().events.push(KeyEvent::Report(key, pressed));
  }

  fn sync(&mut self) {
    self.0.borrow_mut().events.push(KeyEvent::Sync);
  }
}

/// Firmware image with the given header fields and `blocks` 32-byte blocks,
/// header included. Block `n` is filled with the byte `n`.
pub(crate) fn image(model: u8, version: u8, checksum: (u8, u8), blocks: usize) -> Vec<u8> {
  let mut data = Vec::with_capacity(blocks * 32);
  for n in 0..blocks {
    data.extend(core::iter::repeat(n as u8).take(32));
  }
  data[..32].fill(0);
  data[1] = model;
  data[5] = version;
  data[8] = checksum.0;
  data[9] = checksum.1;
  data
}

pub(crate) struct Resources(pub(crate) Vec<(&'static str, Vec<u8>)>);

impl BundledFirmware for Resources {
  fn lookup(&self, name: &str) -> Option<&[u8]> {
    self.0.iter().find(|(n, _)| *n == name).map(|(_, d)| d.as_slice())
  }
}

/// External storage holding at most one file; `short_by` truncates reads.
pub(crate) struct Storage {
  pub(crate) file: Option<(&'static str, Vec<u8>)>,
  pub(crate) short_by: usize,
}

impl ExternalStorage for Storage {
  type Error = ();

  async fn file_size(&mut self, path: &str) -> Result<usize, Self::Error> {
    match &self.file {
      Some((p, d)) if *p == path => Ok(d.len()),
      _ => Err(()),
    }
  }

  async fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, Self::Error> {
    match &self.file {
      Some((p, d)) if *p == path => {
        let n = d.len().min(buf.len()).saturating_sub(self.short_by);
        buf[..n].copy_from_slice(&d[..n]);
        Ok(n)
      }
      _ => Err(()),
    }
  }
}
