//! Natural key types
//!
//! Names compare case-insensitively but keep the spelling they were created
//! with for display. Volume and minor numbers are range-checked integers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum length of any object name
pub const NAME_MAX_LENGTH: usize = 48;

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name is empty")),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(invalid("name must start with a letter"))
        }
        Some(_) => {}
    }
    if name.len() > NAME_MAX_LENGTH {
        return Err(invalid("name is too long"));
    }
    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(invalid(&format!("invalid character '{}'", c)));
    }
    Ok(())
}

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            display: String,
            value: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let display = name.into();
                validate_name($kind, &display)?;
                let value = display.to_ascii_uppercase();
                Ok(Self { display, value })
            }

            /// Normalized (upper case) form used for keys and storage paths
            pub fn value(&self) -> &str {
                &self.value
            }

            /// Spelling supplied at creation
            pub fn display_name(&self) -> &str {
                &self.display
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.value == other.value
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.value.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.value.cmp(&other.value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.display)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.display)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.display
            }
        }
    };
}

define_name!(
    /// Name of a cluster node
    NodeName,
    "node"
);

define_name!(
    /// Name of a resource definition
    ResourceName,
    "resource"
);

define_name!(
    /// Name of a storage pool definition
    StorPoolName,
    "storage pool"
);

define_name!(
    /// Name of a network interface, unique per node
    NetInterfaceName,
    "network interface"
);

// =============================================================================
// Numbers
// =============================================================================

/// Volume number within a resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct VolumeNumber(u16);

impl VolumeNumber {
    pub const MIN: i64 = 0;
    pub const MAX: i64 = 32767;

    pub fn new(value: i64) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(Error::ValueOutOfRange {
                what: "volume number",
                value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value as u16))
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl TryFrom<i64> for VolumeNumber {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<VolumeNumber> for i64 {
    fn from(nr: VolumeNumber) -> i64 {
        nr.0 as i64
    }
}

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block device minor number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MinorNumber(u32);

impl MinorNumber {
    pub const MIN: i64 = 0;
    pub const MAX: i64 = 1_048_575;

    pub fn new(value: i64) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(Error::ValueOutOfRange {
                what: "minor number",
                value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value as u32))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for MinorNumber {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MinorNumber> for i64 {
    fn from(nr: MinorNumber) -> i64 {
        nr.0 as i64
    }
}

impl fmt::Display for MinorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    #[test]
    fn test_name_case_insensitive_identity() {
        let a = NodeName::new("alpha").unwrap();
        let b = NodeName::new("ALPHA").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.display_name(), "alpha");
        assert_eq!(b.display_name(), "ALPHA");
        assert_eq!(a.value(), "ALPHA");

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_name_validation() {
        assert!(ResourceName::new("rsc_0-a").is_ok());
        assert_matches!(ResourceName::new(""), Err(Error::InvalidName { .. }));
        assert_matches!(ResourceName::new("0rsc"), Err(Error::InvalidName { .. }));
        assert_matches!(ResourceName::new("rsc/x"), Err(Error::InvalidName { .. }));
        assert_matches!(
            ResourceName::new("r".repeat(NAME_MAX_LENGTH + 1)),
            Err(Error::InvalidName { .. })
        );
    }

    #[test]
    fn test_name_serde_keeps_display_spelling() {
        let name = StorPoolName::new("ThinPool").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"ThinPool\"");

        let back: StorPoolName = serde_json::from_str(&json).unwrap();
        assert_eq!(back.display_name(), "ThinPool");
        assert!(serde_json::from_str::<StorPoolName>("\"9pool\"").is_err());
    }

    #[test]
    fn test_number_ranges() {
        assert_eq!(VolumeNumber::new(0).unwrap().value(), 0);
        assert_eq!(VolumeNumber::new(32767).unwrap().value(), 32767);
        assert_matches!(VolumeNumber::new(-1), Err(Error::ValueOutOfRange { .. }));
        assert_matches!(VolumeNumber::new(32768), Err(Error::ValueOutOfRange { .. }));

        assert!(MinorNumber::new(1_048_575).is_ok());
        assert_matches!(MinorNumber::new(1_048_576), Err(Error::ValueOutOfRange { .. }));
    }
}
