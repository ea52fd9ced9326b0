use bitfield_struct::bitfield;

use super::Key;

/// Edge-encoded key status, as read from the status register on every
/// interrupt.
///
/// Each key owns a 2-bit field: `0` nothing happened, `2` pressed,
/// `1` released. The grip field is only meaningful on grip builds.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonStatus {
  #[bits(2)]
  pub recent: u8,
  #[bits(2)]
  pub back: u8,
  #[bits(2)]
  pub grip: u8,
  #[bits(2)]
  __: u8,
}

/// Field value of a press transition.
pub(crate) const PRESSED: u8 = 2;

impl ButtonStatus {
  pub fn field(&self, key: Key) -> u8 {
    match key {
      Key::Recent => self.recent(),
      Key::Back => self.back(),
      Key::Grip => self.grip(),
    }
  }

  /// `Some(pressed)` when the status carries an edge for `key`.
  pub fn edge(&self, key: Key) -> Option<bool> {
    match self.field(key) {
      0 => None,
      v => Some(v % 2 == 0),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.recent() == 0 && self.back() == 0 && self.grip() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fields_are_two_bits_from_lsb() {
    let status = ButtonStatus::from(0b10_01_10);
    assert_eq!(status.recent(), 2);
    assert_eq!(status.back(), 1);
    assert_eq!(status.grip(), 2);
  }

  #[test]
  fn even_field_is_press() {
    assert_eq!(ButtonStatus::from(0b10).edge(Key::Recent), Some(true));
    assert_eq!(ButtonStatus::from(0b01).edge(Key::Recent), Some(false));
    assert_eq!(ButtonStatus::from(0b10).edge(Key::Back), None);
    assert_eq!(ButtonStatus::from(0b0100).edge(Key::Back), Some(false));
  }

  #[test]
  fn reserved_bits_do_not_count() {
    assert!(ButtonStatus::from(0b1100_0000).is_empty());
  }
}
