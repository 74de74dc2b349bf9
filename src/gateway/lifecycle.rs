//! Lifecycle of a single cache generation.

use color_eyre::{eyre::eyre, Result};
use std::fmt;

/// Where a generation is in its install/activate cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  /// Created, nothing done yet
  Parsed,
  /// Manifest is being fetched
  Installing,
  /// Manifest cached; waiting to take over
  Installed,
  /// Deleting other generations
  Activating,
  /// Serving traffic
  Activated,
  /// Install failed or a newer generation took over
  Redundant,
}

impl Lifecycle {
  /// Check that moving to `next` is a legal step.
  pub fn advance(self, next: Lifecycle) -> Result<Lifecycle> {
    use Lifecycle::*;
    let allowed = matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activating, Installed)
        | (Activated, Redundant)
    );

    if allowed {
      Ok(next)
    } else {
      Err(eyre!("Illegal lifecycle transition {} -> {}", self, next))
    }
  }
}

impl fmt::Display for Lifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}
