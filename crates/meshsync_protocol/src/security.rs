//! Security labels exchanged during ability sync and remote query.

use serde::{Deserialize, Serialize};

/// Data sensitivity label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum SecurityLabel {
    /// Peer does not support labels.
    NotSupport,
    /// No label configured.
    #[default]
    NotSet,
    /// Level 0.
    S0,
    /// Level 1.
    S1,
    /// Level 2.
    S2,
    /// Level 3.
    S3,
    /// Level 4.
    S4,
}

/// Label modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityFlag {
    /// Bound to the device.
    #[default]
    Ece,
    /// Sensitive to the screen lock.
    Sece,
}

/// A peer's declared security option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityOption {
    /// The label.
    pub label: SecurityLabel,
    /// The flag.
    pub flag: SecurityFlag,
}

impl SecurityOption {
    /// Creates an option.
    pub fn new(label: SecurityLabel, flag: SecurityFlag) -> Self {
        Self { label, flag }
    }

    /// Labels are compatible when equal or when either side has not set one.
    pub fn is_compatible_with(&self, remote: &SecurityOption) -> bool {
        self.label == SecurityLabel::NotSet
            || remote.label == SecurityLabel::NotSet
            || self.label == remote.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_rules() {
        let s2 = SecurityOption::new(SecurityLabel::S2, SecurityFlag::Ece);
        let s3 = SecurityOption::new(SecurityLabel::S3, SecurityFlag::Ece);
        let unset = SecurityOption::default();
        assert!(s2.is_compatible_with(&s2));
        assert!(!s2.is_compatible_with(&s3));
        assert!(s2.is_compatible_with(&unset));
        assert!(unset.is_compatible_with(&s3));
    }
}
