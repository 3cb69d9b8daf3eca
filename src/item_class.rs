//! The six recognised item classes.

use std::fmt;

/// Item classes, as carried in the `class` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemClass {
    /// Application password.
    GenericPassword,
    /// Password for a network service.
    InternetPassword,
    /// AppleShare volume password.
    AppleSharePassword,
    /// X.509 certificate.
    Certificate,
    /// Cryptographic key.
    Key,
    /// Certificate paired with its private key.
    Identity,
}

impl ItemClass {
    /// Every recognised class.
    pub const ALL: [Self; 6] = [
        Self::GenericPassword,
        Self::InternetPassword,
        Self::AppleSharePassword,
        Self::Certificate,
        Self::Key,
        Self::Identity,
    ];

    /// The 4-byte ASCII tag, also used as the `class` attribute value.
    #[must_use]
    pub const fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::GenericPassword => b"genp",
            Self::InternetPassword => b"inet",
            Self::AppleSharePassword => b"ashp",
            Self::Certificate => b"cert",
            Self::Key => b"keys",
            Self::Identity => b"idnt",
        }
    }

    /// The `class` attribute value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GenericPassword => "genp",
            Self::InternetPassword => "inet",
            Self::AppleSharePassword => "ashp",
            Self::Certificate => "cert",
            Self::Key => "keys",
            Self::Identity => "idnt",
        }
    }

    /// Look up a class by its 4-byte tag.
    #[must_use]
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.tag().as_slice() == tag)
    }

    /// Look up a class by its attribute value.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_tag(name.as_bytes())
    }

    /// Whether this class stores a password.
    #[must_use]
    pub const fn is_password(self) -> bool {
        matches!(
            self,
            Self::GenericPassword | Self::InternetPassword | Self::AppleSharePassword
        )
    }
}

impl fmt::Display for ItemClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenericPassword => write!(f, "generic password"),
            Self::InternetPassword => write!(f, "internet password"),
            Self::AppleSharePassword => write!(f, "AppleShare password"),
            Self::Certificate => write!(f, "certificate"),
            Self::Key => write!(f, "key"),
            Self::Identity => write!(f, "identity"),
        }
    }
}
