use core::fmt::Debug;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use log::{error, info};

use crate::boot::{BLOCK_SIZE, START_ADDRESS};
use crate::power::Power;
use crate::{Config, Error, KeySink, Touchkey};

mod flash;

pub use flash::FlashState;

/// Image header layout: the first block describes the image and is never
/// written to flash.
const MODEL_OFFSET: usize = 1;
const VERSION_OFFSET: usize = 5;
const CHECKSUM_HIGH_OFFSET: usize = 8;
const CHECKSUM_LOW_OFFSET: usize = 9;

/// Flash checksum as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Checksum {
  pub high: u8,
  pub low: u8,
}

/// Where a firmware image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareSource {
  /// Resource bundled with the host firmware.
  Bundled,
  /// File on external storage.
  External,
}

impl FirmwareSource {
  /// Source selected by an update trigger: `s`/`S` bundled, `i`/`I`
  /// external.
  pub fn from_command(command: u8) -> Option<Self> {
    match command {
      b's' | b'S' => Some(FirmwareSource::Bundled),
      b'i' | b'I' => Some(FirmwareSource::External),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResourceError {
  /// No such resource or file.
  NotFound,
  /// The file could not be read completely.
  Io,
  /// The file does not fit the caller's buffer.
  TooLarge,
  /// Too short to carry an image header.
  Malformed,
}

/// Firmware image borrowed from its provider for one update.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareImage<'a> {
  data: &'a [u8],
  source: FirmwareSource,
}

impl<'a> FirmwareImage<'a> {
  pub fn parse(data: &'a [u8], source: FirmwareSource) -> Result<Self, ResourceError> {
    if data.len() < BLOCK_SIZE {
      return Err(ResourceError::Malformed);
    }
    Ok(Self { data, source })
  }

  pub fn source(&self) -> FirmwareSource {
    self.source
  }

  pub fn model_number(&self) -> u8 {
    self.data[MODEL_OFFSET]
  }

  pub fn version(&self) -> u8 {
    self.data[VERSION_OFFSET]
  }

  pub fn checksum(&self) -> Checksum {
    Checksum { high: self.data[CHECKSUM_HIGH_OFFSET], low: self.data[CHECKSUM_LOW_OFFSET] }
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  /// Whole blocks in the image, header included. A trailing partial block
  /// is ignored.
  pub fn block_count(&self) -> usize {
    self.data.len() / BLOCK_SIZE
  }

  /// Block `index`, `None` past the last whole block. Block 0 is the
  /// header and never programmed.
  pub fn block(&self, index: usize) -> Option<&'a [u8]> {
    self.data.get(index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE)
  }
}

/// Flash address of block `index` (index 1 being the first programmed).
pub(crate) fn block_address(index: usize) -> u16 {
  START_ADDRESS.wrapping_add(((index - 1) * BLOCK_SIZE) as u16)
}

/// Firmware resources bundled with the host, looked up by name.
pub trait BundledFirmware {
  fn lookup(&self, name: &str) -> Option<&[u8]>;
}

/// File access on external storage.
#[allow(async_fn_in_trait)]
pub trait ExternalStorage {
  type Error: Debug;

  async fn file_size(&mut self, path: &str) -> Result<usize, Self::Error>;

  /// Read the file from its start into `buf`, returning the bytes read.
  async fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Both places a firmware image can come from.
pub struct FirmwareProviders<B, S> {
  pub bundled: B,
  pub storage: S,
}

impl<B: BundledFirmware, S: ExternalStorage> FirmwareProviders<B, S> {
  pub fn new(bundled: B, storage: S) -> Self {
    Self { bundled, storage }
  }

  pub fn load_bundled(&self, name: &str) -> Result<FirmwareImage<'_>, ResourceError> {
    let data = self.bundled.lookup(name).ok_or_else(|| {
      error!("touchkey: firmware {} not found", name);
      ResourceError::NotFound
    })?;
    let image = FirmwareImage::parse(data, FirmwareSource::Bundled)?;
    log_header(&image);
    Ok(image)
  }

  /// Read a whole image file into `buf`.
  pub async fn load_external<'a>(&mut self, path: &str, buf: &'a mut [u8]) -> Result<FirmwareImage<'a>, ResourceError> {
    let size = self.storage.file_size(path).await.map_err(|e| {
      error!("touchkey: {} open error: {:?}", path, e);
      ResourceError::NotFound
    })?;
    if size > buf.len() {
      error!("touchkey: {} is {} bytes, buffer holds {}", path, size, buf.len());
      return Err(ResourceError::TooLarge);
    }
    let read = self.storage.read(path, &mut buf[..size]).await.map_err(|e| {
      error!("touchkey: {} read error: {:?}", path, e);
      ResourceError::Io
    })?;
    if read != size {
      error!("touchkey: {} short read, {} of {}", path, read, size);
      return Err(ResourceError::Io);
    }
    let image = FirmwareImage::parse(&buf[..size], FirmwareSource::External)?;
    log_header(&image);
    Ok(image)
  }

  pub async fn load<'a>(
    &'a mut self,
    source: FirmwareSource,
    config: &Config,
    buf: &'a mut [u8],
  ) -> Result<FirmwareImage<'a>, ResourceError> {
    match source {
      FirmwareSource::Bundled => self.load_bundled(config.firmware_name),
      FirmwareSource::External => self.load_external(config.external_path, buf).await,
    }
  }
}

fn log_header(image: &FirmwareImage<'_>) {
  let checksum = image.checksum();
  info!(
    "touchkey: image model {:#04x} version {:#04x} checksum {:02X}{:02X}, {} bytes",
    image.model_number(),
    image.version(),
    checksum.high,
    checksum.low,
    image.size()
  );
}

/// State of the last firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateStatus {
  #[default]
  Pass,
  Downloading,
  Fail,
}

impl UpdateStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      UpdateStatus::Pass => "PASS",
      UpdateStatus::Downloading => "Downloading",
      UpdateStatus::Fail => "Fail",
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
  pub fn update_status(&self) -> UpdateStatus {
    self.state().update
  }

  /// Reflash the device on request.
  ///
  /// `command` selects the image source (see [`FirmwareSource::from_command`]);
  /// `buf` receives external images. Interrupts are masked and the device
  /// disabled for the whole session, and the cached modes are written back
  /// afterwards whether it succeeded or not.
  pub async fn update_firmware<B, S>(
    &self,
    command: u8,
    providers: &mut FirmwareProviders<B, S>,
    buf: &mut [u8],
  ) -> Result<(), Error<E>>
  where
    B: BundledFirmware,
    S: ExternalStorage,
  {
    let Some(source) = FirmwareSource::from_command(command) else {
      error!("touchkey: unknown update command {:#04x}", command);
      self.with_state(|s| s.update = UpdateStatus::Fail);
      return Err(Error::InvalidCommand(command));
    };
    let image = match providers.load(source, &self.config, buf).await {
      Ok(image) => image,
      Err(e) => {
        self.with_state(|s| s.update = UpdateStatus::Fail);
        return Err(e.into());
      }
    };

    self.with_state(|s| {
      s.update = UpdateStatus::Downloading;
      if source == FirmwareSource::Bundled {
        s.image_version = image.version();
      }
    });

    let mask = self.mask_interrupt().await;
    self.set_enabled(false);
    let result = self.flash(&mask, &image).await;
    self.restore_modes().await;
    self.set_enabled(true);
    drop(mask);

    let status = if result.is_ok() { UpdateStatus::Pass } else { UpdateStatus::Fail };
    self.with_state(|s| s.update = status);
    match &result {
      Ok(()) => info!("touchkey: firmware update done"),
      Err(e) => error!("touchkey: firmware update failed: {}", e.kind()),
    }
    result
  }
}
