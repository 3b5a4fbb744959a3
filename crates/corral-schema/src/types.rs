//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so documents stay
//! readable in the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Identifier of the model a document belongs to; prefixes every document id.
    ModelUuid
);

string_newtype!(
    /// Name of an application, e.g. `wordpress`.
    ApplicationName
);

string_newtype!(
    /// Name of a unit, `<application>/<number>`.
    UnitName
);

string_newtype!(
    /// Machine identifier: `0`, or `0/lxd/1` for a container.
    MachineId
);

string_newtype!(
    /// Canonical relation key: endpoints sorted and joined by a space.
    RelationKey
);

string_newtype!(
    /// Name under which an application is offered to other models.
    OfferName
);

impl UnitName {
    /// The application part of the unit name.
    pub fn application(&self) -> ApplicationName {
        let app = self.0.split_once('/').map_or(self.0.as_str(), |(a, _)| a);
        ApplicationName::new(app)
    }

    /// The unit number, if the name is well formed.
    pub fn number(&self) -> Option<u64> {
        self.0.split_once('/').and_then(|(_, n)| n.parse().ok())
    }
}

impl MachineId {
    /// The parent machine of a container, `None` for top-level machines.
    pub fn parent(&self) -> Option<MachineId> {
        let parts: Vec<&str> = self.0.split('/').collect();
        if parts.len() < 3 {
            return None;
        }
        Some(MachineId::new(parts[..parts.len() - 2].join("/")))
    }

    pub fn is_container(&self) -> bool {
        self.0.contains('/')
    }
}
