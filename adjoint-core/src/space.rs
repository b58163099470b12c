//!
//! Space types of variables, relative to the space they were created in.
//!

/// Which variant of a space a variable lives in.
///
/// Two independent flags hide in here, "conjugate" and "dual", so composing a
/// type with a relative type is just xor on both flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpaceType {
  #[default]
  Primal,
  Conjugate,
  Dual,
  ConjugateDual,
}

impl SpaceType {
  #[inline(always)]
  fn bits(self) -> u8 {
    match self {
      SpaceType::Primal => 0b00,
      SpaceType::Conjugate => 0b01,
      SpaceType::Dual => 0b10,
      SpaceType::ConjugateDual => 0b11,
    }
  }

  #[inline(always)]
  fn from_bits(bits: u8) -> Self {
    match bits & 0b11 {
      0b00 => SpaceType::Primal,
      0b01 => SpaceType::Conjugate,
      0b10 => SpaceType::Dual,
      _ => SpaceType::ConjugateDual,
    }
  }

  /// The space type reached by applying `rel` to a variable of type `self`
  #[inline]
  pub fn relative(self, rel: SpaceType) -> SpaceType {
    Self::from_bits(self.bits() ^ rel.bits())
  }

  pub fn is_dual(self) -> bool {
    self.bits() & 0b10 != 0
  }

  pub fn is_conjugate(self) -> bool {
    self.bits() & 0b01 != 0
  }
}
