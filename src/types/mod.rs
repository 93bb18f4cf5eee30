//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! `TriggerId` where a `JobId` is expected) and make the code more
//! self-documenting. All of them wrap a UUID and serialize transparently.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Parses the identifier from its canonical string form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok($name(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }
    };
}

uuid_id!(
    /// An AREA (one automation binding one action to one or more reactions).
    AreaId
);
uuid_id!(
    /// The user owning an AREA or identity.
    UserId
);
uuid_id!(
    /// An activation source attached to an action.
    SourceId
);
uuid_id!(
    /// A catalog component (action or reaction).
    ComponentId
);
uuid_id!(
    /// A configured instance of a component (params bound to an AREA link).
    ConfigId
);
uuid_id!(
    /// An AREA link (the action link or one reaction link).
    LinkId
);
uuid_id!(
    /// A detected action occurrence.
    EventId
);
uuid_id!(
    /// The association between an event and the AREA it activates.
    TriggerId
);
uuid_id!(
    /// One reaction execution unit.
    JobId
);
uuid_id!(
    /// A linked OAuth identity.
    IdentityId
);
uuid_id!(
    /// A third-party service provider.
    ProviderId
);

/// JSON object used for payloads, cursors, and component metadata.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
