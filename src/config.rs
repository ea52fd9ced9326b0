use crate::reg::I2C_ADDR;

/// Controller variant. Both speak the same register protocol and differ
/// only in the byte the bootloader answers with when entering flash mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Chip {
  #[default]
  A96T316,
  Ft1804,
}

impl Chip {
  pub const fn name(self) -> &'static str {
    match self {
      Chip::A96T316 => "A96T316",
      Chip::Ft1804 => "FT1804",
    }
  }

  /// Whether `id`, read right after the bootloader entry frame, means the
  /// chip is in flash mode.
  pub const fn accepts_flash_mode(self, id: u8) -> bool {
    match self {
      Chip::A96T316 => id == 0x31 || id == 0x18,
      Chip::Ft1804 => id == 0x18,
    }
  }
}

/// Board level configuration, fixed for the lifetime of the driver.
///
/// ```ignore
/// let config = Config::default()
///   .with_grip(true)
///   .with_light_reg(Some(0x0C))
///   .with_ta_notifier(true);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
  /// 7-bit bus address.
  pub address: u8,
  pub chip: Chip,
  /// Name of the bundled firmware resource.
  pub firmware_name: &'static str,
  /// Path of the image used by an external update.
  pub external_path: &'static str,
  /// Grip (SAR) sensing is wired up; enables the grip key and SAR controls.
  pub grip: bool,
  /// Key backlight is driven by the controller.
  pub led: bool,
  /// LED brightness from the panel's light table, written to both LED
  /// registers after every reset.
  pub light_reg: Option<u8>,
  /// Charger (TA) state is forwarded to the device.
  pub ta_notifier: bool,
  /// Bring-up boards skip the version based firmware update.
  pub bringup: bool,
  /// Force an update when the device runs test firmware (version >= 0xD0).
  pub update_test_firmware: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

impl Config {
  pub const fn new() -> Self {
    Self {
      address: I2C_ADDR,
      chip: Chip::A96T316,
      firmware_name: "abov/abov_noble.fw",
      external_path: "/sdcard/abov_fw.bin",
      grip: false,
      led: false,
      light_reg: None,
      ta_notifier: false,
      bringup: false,
      update_test_firmware: false,
    }
  }

  pub const fn with_address(mut self, address: u8) -> Self {
    self.address = address;
    self
  }

  pub const fn with_chip(mut self, chip: Chip) -> Self {
    self.chip = chip;
    self
  }

  pub const fn with_firmware_name(mut self, name: &'static str) -> Self {
    self.firmware_name = name;
    self
  }

  pub const fn with_external_path(mut self, path: &'static str) -> Self {
    self.external_path = path;
    self
  }

  pub const fn with_grip(mut self, grip: bool) -> Self {
    self.grip = grip;
    self
  }

  pub const fn with_led(mut self, led: bool) -> Self {
    self.led = led;
    self
  }

  pub const fn with_light_reg(mut self, light_reg: Option<u8>) -> Self {
    self.light_reg = light_reg;
    self
  }

  pub const fn with_ta_notifier(mut self, ta_notifier: bool) -> Self {
    self.ta_notifier = ta_notifier;
    self
  }

  pub const fn with_bringup(mut self, bringup: bool) -> Self {
    self.bringup = bringup;
    self
  }

  pub const fn with_update_test_firmware(mut self, update: bool) -> Self {
    self.update_test_firmware = update;
    self
  }
}
