use core::fmt::Debug;

use log::debug;

/// Supply control for the controller (regulators, enable pins).
///
/// Sequencing of the individual rails is the implementor's business; the
/// driver only asks for the whole device on or off.
#[allow(async_fn_in_trait)]
pub trait Power {
  type Error: Debug;

  async fn set_power(&mut self, on: bool) -> Result<(), Self::Error>;
}

/// Remembers the last state the collaborator accepted and drops repeated
/// requests for it.
pub(crate) struct PowerSwitch<P> {
  inner: P,
  on: bool,
}

impl<P: Power> PowerSwitch<P> {
  pub(crate) fn new(inner: P, on: bool) -> Self {
    Self { inner, on }
  }

  pub(crate) async fn set(&mut self, on: bool) -> Result<(), P::Error> {
    if self.on == on {
      debug!("touchkey: power already {}", if on { "on" } else { "off" });
      return Ok(());
    }
    self.inner.set_power(on).await?;
    self.on = on;
    Ok(())
  }
}
