/******************************************************************************
 * ABOV A96T316 / FT1804 touchkey controller                                  *
 * ========================================================================== *
 *                     Registers, command bytes & timings                     *
*******************************************************************************/

pub(crate) const I2C_ADDR: u8 = 0x20;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reg {
  // Legacy status / LED command register
  ButtonStatus = 0x00,
  FirmwareVersion = 0x01,
  Threshold = 0x02,
  // Edge-encoded status read on interrupt
  ButtonStatusNew = 0x07,
  // LED dimming (0x01..0x1F)
  LedRecent = 0x08,
  LedBack = 0x09,
  // Per-key strength and raw counts, two big-endian u16 each (0x0A..0x11)
  DiffData = 0x0A,
  RawData = 0x0E,
  VendorId = 0x12,
  // Shared by glove, mobile keyboard and charger (TA) commands
  ModeControl = 0x13,
  ModelNumber = 0x14,
  Flip = 0x15,

  // Grip / SAR block
  SarTotalCap = 0x16,
  SarMode = 0x17,
  SarTotalCapRead = 0x18,
  SwReset = 0x1A,
  SarEnable = 0x24,
  SarSensing = 0x25,
  SarNoiseThreshold = 0x26,
  SarBaseline = 0x28,
  SarDiffData = 0x2A,
  SarRawData = 0x2E,
  // Press threshold 0x32/0x33, release threshold 0x34/0x35
  SarThreshold = 0x32,
}

impl Reg {
  /// Register `n` places after this one, for multi-byte values split across
  /// adjacent registers.
  pub(crate) const fn offset(self, n: u8) -> u8 {
    self as u8 + n
  }
}

impl From<Reg> for u8 {
  #[inline]
  fn from(r: Reg) -> Self {
    r as u8
  }
}

// Values shared by every on/off style register
pub(crate) const CMD_ON: u8 = 0x20;
pub(crate) const CMD_OFF: u8 = 0x10;

pub(crate) const CMD_LED_ON: u8 = 0x10;
pub(crate) const CMD_LED_OFF: u8 = 0x20;

pub(crate) const CMD_SW_RESET: u8 = 0x10;

// Charger attached is reported as "off", detached as "on"
pub(crate) const CMD_TA_CONNECTED: u8 = 0x10;
pub(crate) const CMD_TA_DISCONNECTED: u8 = 0x20;

pub(crate) const CMD_TOTAL_CAP_TRIGGER: u8 = 0x20;

/// Bootloader framing. These frames bypass the register protocol.
pub(crate) mod boot {
  pub(crate) const ENTER: [u8; 2] = [0xAC, 0x5B];
  pub(crate) const ERASE: [u8; 2] = [0xAC, 0x2D];
  pub(crate) const WRITE: [u8; 2] = [0xAC, 0x7A];
  pub(crate) const EXIT: [u8; 2] = [0xAC, 0xE1];
  pub(crate) const CHECKSUM_RANGE: [u8; 6] = [0xAC, 0x9E, 0x10, 0x00, 0x3F, 0xFF];
  pub(crate) const CHECKSUM_TRIGGER: [u8; 1] = [0x00];

  /// Bit 0 of a raw status read while programming.
  pub(crate) const BUSY: u8 = 0x01;
  pub(crate) const BUSY_POLL_LIMIT: u32 = 1000;

  /// Flash address of block 1; block 0 is the image header.
  pub(crate) const START_ADDRESS: u16 = 0x0800;
  pub(crate) const BLOCK_SIZE: usize = 32;
  pub(crate) const FRAME_LEN: usize = WRITE.len() + 2 + BLOCK_SIZE;
}

/// Fixed protocol delays, in milliseconds.
pub(crate) mod timing {
  pub(crate) const BOOT_DELAY_MS: u32 = 45;
  pub(crate) const RESET_DELAY_MS: u32 = 150;
  pub(crate) const POWER_OFF_MS: u32 = 50;
  pub(crate) const BUS_RETRY_MS: u32 = 10;
  pub(crate) const MODE_ENTER_MS: u32 = 5;
  pub(crate) const ERASE_MS: u32 = 1400;
  pub(crate) const BLOCK_WRITE_MS: u32 = 3;
  pub(crate) const CHECKSUM_STEP_MS: u32 = 5;
  pub(crate) const LED_SETTLE_MS: u32 = 20;
  pub(crate) const SAR_MODE_SETTLE_MS: u32 = 40;
  pub(crate) const SAR_MODE_RETRY_MS: u32 = 20;
  pub(crate) const TOTAL_CAP_US: u32 = 10;
  pub(crate) const GRIP_MONITOR_MS: u32 = 2000;
}
