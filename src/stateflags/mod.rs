//! State Flags
//!
//! A 64-bit mask over an entity-specific flag enum. Every flag is a distinct
//! power of two; external representations are ordered name lists.

use crate::error::{Error, Result};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::TxAnchor;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// =============================================================================
// Flag Trait
// =============================================================================

/// A flag enum usable in [`StateFlags`]
pub trait Flag: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Enum name for error messages
    const KIND: &'static str;

    /// All flags in declaration order
    const ALL: &'static [Self];

    /// Bit value, a power of two
    fn value(self) -> u64;

    /// External name
    fn name(self) -> &'static str;

    fn valid_mask() -> u64 {
        Self::mask_of(Self::ALL)
    }

    fn mask_of(flags: &[Self]) -> u64 {
        flags.iter().fold(0, |mask, flag| mask | flag.value())
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|flag| flag.name().eq_ignore_ascii_case(name))
    }

    /// Names of the flags set in `mask`, in declaration order
    fn to_name_list(mask: u64) -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|flag| mask & flag.value() == flag.value())
            .map(|flag| flag.name())
            .collect()
    }

    fn from_name_list<S: AsRef<str>>(names: &[S]) -> Result<u64> {
        names.iter().try_fold(0, |mask, name| {
            let name = name.as_ref();
            Self::from_name(name)
                .map(|flag| mask | flag.value())
                .ok_or_else(|| Error::UnknownFlag {
                    kind: Self::KIND,
                    name: name.to_string(),
                })
        })
    }

    /// Reject masks with bits outside the enum
    fn validate_mask(mask: u64) -> Result<u64> {
        if mask & !Self::valid_mask() != 0 {
            return Err(Error::InvalidFlags {
                kind: Self::KIND,
                bits: mask,
            });
        }
        Ok(mask)
    }

    /// Flags set in a stored mask
    fn restore_flags(mask: u64) -> Result<Vec<Self>> {
        let mask = Self::validate_mask(mask)?;
        Ok(Self::ALL
            .iter()
            .copied()
            .filter(|flag| mask & flag.value() != 0)
            .collect())
    }
}

/// Declare a flag enum with its bit values and external names
macro_rules! define_flags {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr => $ext:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $crate::stateflags::Flag for $name {
            const KIND: &'static str = stringify!($name);
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn value(self) -> u64 {
                match self {
                    $(Self::$variant => $value),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $ext),+
                }
            }
        }
    };
}

pub(crate) use define_flags;

// =============================================================================
// State Flags
// =============================================================================

#[derive(Debug)]
struct FlagState {
    bits: u64,
    committed: Option<u64>,
}

/// Transactional flag set of one entity
pub struct StateFlags<F: Flag> {
    anchor: Arc<TxAnchor>,
    protection: Arc<ObjectProtection>,
    state: Mutex<FlagState>,
    _flag: PhantomData<fn() -> F>,
}

impl<F: Flag> StateFlags<F> {
    pub fn new(anchor: Arc<TxAnchor>, protection: Arc<ObjectProtection>, bits: u64) -> Self {
        Self {
            anchor,
            protection,
            state: Mutex::new(FlagState {
                bits,
                committed: None,
            }),
            _flag: PhantomData,
        }
    }

    /// True if every flag in `flags` is set
    pub fn is_set(&self, acc: &AccessContext, flags: &[F]) -> Result<bool> {
        self.protection.require_access(acc, AccessType::View)?;
        let mask = F::mask_of(flags);
        Ok(self.raw_bits() & mask == mask)
    }

    /// True if every flag in `flags` is unset
    pub fn is_unset(&self, acc: &AccessContext, flags: &[F]) -> Result<bool> {
        self.protection.require_access(acc, AccessType::View)?;
        Ok(self.raw_bits() & F::mask_of(flags) == 0)
    }

    /// True if at least one flag in `flags` is set
    pub fn is_some_set(&self, acc: &AccessContext, flags: &[F]) -> Result<bool> {
        self.protection.require_access(acc, AccessType::View)?;
        Ok(self.raw_bits() & F::mask_of(flags) != 0)
    }

    pub fn enable_flags(&self, acc: &AccessContext, flags: &[F]) -> Result<()> {
        self.protection.require_access(acc, AccessType::Change)?;
        let mask = F::mask_of(flags);
        self.apply(|bits| bits | mask);
        Ok(())
    }

    pub fn disable_flags(&self, acc: &AccessContext, flags: &[F]) -> Result<()> {
        self.protection.require_access(acc, AccessType::Change)?;
        let mask = F::mask_of(flags);
        self.apply(|bits| bits & !mask);
        Ok(())
    }

    pub fn enable_all_flags(&self, acc: &AccessContext) -> Result<()> {
        self.enable_flags(acc, F::ALL)
    }

    pub fn disable_all_flags(&self, acc: &AccessContext) -> Result<()> {
        self.protection.require_access(acc, AccessType::Change)?;
        self.apply(|_| 0);
        Ok(())
    }

    /// Set exactly `flags`, clearing everything else
    pub fn reset_flags_to(&self, acc: &AccessContext, flags: &[F]) -> Result<()> {
        self.protection.require_access(acc, AccessType::Change)?;
        let mask = F::mask_of(flags);
        self.apply(|_| mask);
        Ok(())
    }

    pub fn flags_bits(&self, acc: &AccessContext) -> Result<u64> {
        self.protection.require_access(acc, AccessType::View)?;
        Ok(self.raw_bits())
    }

    /// Flags currently set, in declaration order
    pub fn flags(&self, acc: &AccessContext) -> Result<Vec<F>> {
        let bits = self.flags_bits(acc)?;
        Ok(F::ALL
            .iter()
            .copied()
            .filter(|flag| bits & flag.value() != 0)
            .collect())
    }

    pub(crate) fn raw_bits(&self) -> u64 {
        self.state.lock().bits
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().committed.is_some()
    }

    pub fn commit(&self) {
        self.state.lock().committed = None;
    }

    pub fn rollback(&self) {
        let mut st = self.state.lock();
        if let Some(committed) = st.committed.take() {
            st.bits = committed;
        }
    }

    fn apply(&self, change: impl FnOnce(u64) -> u64) {
        {
            let mut st = self.state.lock();
            let bits = change(st.bits);
            if st.bits == bits {
                return;
            }
            if st.committed.is_none() {
                st.committed = Some(st.bits);
            }
            st.bits = bits;
        }
        self.anchor.touch();
    }
}

impl<F: Flag> fmt::Debug for StateFlags<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(F::to_name_list(self.raw_bits())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    define_flags! {
        /// Flags used only by these tests
        TestFlag {
            Alpha = 1 << 0 => "ALPHA",
            Beta = 1 << 1 => "BETA",
            Gamma = 1 << 2 => "GAMMA",
            Delta = 1 << 5 => "DELTA",
            Omega = 1 << 16 => "OMEGA",
        }
    }

    fn flags(bits: u64) -> (Arc<TxAnchor>, StateFlags<TestFlag>) {
        let anchor = TxAnchor::loaded();
        let protection = Arc::new(ObjectProtection::new(&AccessContext::system(), "test"));
        let flags = StateFlags::new(anchor.clone(), protection, bits);
        (anchor, flags)
    }

    #[test]
    fn test_values_are_distinct_powers_of_two() {
        let mut seen = 0u64;
        for flag in TestFlag::ALL {
            assert!(flag.value().is_power_of_two());
            assert_eq!(seen & flag.value(), 0);
            seen |= flag.value();
        }
    }

    #[test]
    fn test_name_list_follows_declaration_order() {
        let mask = TestFlag::mask_of(&[TestFlag::Omega, TestFlag::Alpha, TestFlag::Gamma]);
        assert_eq!(TestFlag::to_name_list(mask), vec!["ALPHA", "GAMMA", "OMEGA"]);

        let back = TestFlag::from_name_list(&["omega", "ALPHA", "Gamma"]).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_unknown_name_and_invalid_bits_rejected() {
        assert_matches!(
            TestFlag::from_name_list(&["ALPHA", "ZETA"]),
            Err(Error::UnknownFlag { name, .. }) if name == "ZETA"
        );
        assert_matches!(TestFlag::restore_flags(1 << 3), Err(Error::InvalidFlags { .. }));
        assert_eq!(
            TestFlag::restore_flags(0b11).unwrap(),
            vec![TestFlag::Alpha, TestFlag::Beta]
        );
    }

    #[test]
    fn test_is_set_uses_and_semantics() {
        let (_, flags) = flags(TestFlag::mask_of(&[TestFlag::Alpha, TestFlag::Beta]));
        let acc = AccessContext::system();

        assert!(flags.is_set(&acc, &[TestFlag::Alpha, TestFlag::Beta]).unwrap());
        assert!(!flags.is_set(&acc, &[TestFlag::Alpha, TestFlag::Gamma]).unwrap());
        assert!(flags.is_some_set(&acc, &[TestFlag::Alpha, TestFlag::Gamma]).unwrap());
        assert!(flags.is_unset(&acc, &[TestFlag::Gamma, TestFlag::Delta]).unwrap());
        assert!(!flags.is_unset(&acc, &[TestFlag::Gamma, TestFlag::Beta]).unwrap());
    }

    #[test]
    fn test_enable_disable_marks_dirty_and_rolls_back() {
        let (anchor, flags) = flags(0);
        let acc = AccessContext::system();

        flags.enable_flags(&acc, &[TestFlag::Beta]).unwrap();
        flags.enable_flags(&acc, &[TestFlag::Delta]).unwrap();
        flags.disable_flags(&acc, &[TestFlag::Beta]).unwrap();
        assert!(flags.is_dirty());
        assert!(anchor.is_dirty());
        assert_eq!(flags.flags(&acc).unwrap(), vec![TestFlag::Delta]);

        flags.rollback();
        assert_eq!(flags.flags_bits(&acc).unwrap(), 0);

        flags.enable_all_flags(&acc).unwrap();
        flags.commit();
        flags.disable_all_flags(&acc).unwrap();
        flags.rollback();
        assert_eq!(flags.flags_bits(&acc).unwrap(), TestFlag::valid_mask());
    }

    #[test]
    fn test_unchanged_mask_is_not_dirty() {
        let (anchor, flags) = flags(TestFlag::Alpha.value());
        flags
            .enable_flags(&AccessContext::system(), &[TestFlag::Alpha])
            .unwrap();
        assert!(!flags.is_dirty());
        assert!(!anchor.is_dirty());
    }

    #[test]
    fn test_flag_access_checked() {
        let owner = AccessContext::new("alice", "ops");
        let stranger = AccessContext::new("mallory", "guest");
        let protection = Arc::new(ObjectProtection::new(&owner, "test"));
        let flags: StateFlags<TestFlag> = StateFlags::new(TxAnchor::loaded(), protection, 0);

        assert_matches!(
            flags.enable_flags(&stranger, &[TestFlag::Alpha]),
            Err(Error::AccessDenied { .. })
        );
        assert_matches!(
            flags.is_set(&stranger, &[TestFlag::Alpha]),
            Err(Error::AccessDenied { .. })
        );
        assert!(flags.enable_flags(&owner, &[TestFlag::Alpha]).is_ok());
    }

    proptest! {
        #[test]
        fn name_list_round_trips(subset in proptest::collection::vec(any::<bool>(), TestFlag::ALL.len())) {
            let chosen: Vec<TestFlag> = TestFlag::ALL
                .iter()
                .zip(subset.iter())
                .filter(|(_, keep)| **keep)
                .map(|(flag, _)| *flag)
                .collect();
            let mask = TestFlag::mask_of(&chosen);

            let names = TestFlag::to_name_list(mask);
            prop_assert_eq!(TestFlag::from_name_list(names.as_slice()).unwrap(), mask);

            let expected: Vec<&str> = chosen.iter().map(|flag| flag.name()).collect();
            prop_assert_eq!(names, expected);
        }

        #[test]
        fn arbitrary_masks_validate_against_enum(mask in any::<u64>()) {
            let valid = mask & !TestFlag::valid_mask() == 0;
            prop_assert_eq!(TestFlag::validate_mask(mask).is_ok(), valid);
        }
    }
}
