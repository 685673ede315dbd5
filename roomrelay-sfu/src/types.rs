//! Common identifier types used throughout the relay

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a live signaling connection; doubles as the peer identifier
    PeerId
);

string_id!(
    /// Opaque room identifier chosen by clients (typically a UUID)
    RoomId
);

string_id!(
    /// Media engine router identifier
    RouterId
);

string_id!(
    /// Media engine transport identifier
    TransportId
);

string_id!(
    /// Media engine producer identifier
    ProducerId
);

string_id!(
    /// Media engine consumer identifier
    ConsumerId
);

impl PeerId {
    /// Generate a fresh connection identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(16))
    }
}

/// Direction of a WebRTC transport relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media to the relay (carries producers)
    Send,
    /// Client receives media from the relay (carries consumers)
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_transparent_strings() {
        let id = ProducerId::from("p1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p1\"");
        assert_eq!(id.to_string(), "p1");
        assert_eq!(id.as_str(), "p1");
    }

    #[test]
    fn test_generated_peer_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_direction_wire_format() {
        let dir: TransportDirection = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(dir, TransportDirection::Recv);
        assert_eq!(TransportDirection::Send.to_string(), "send");
    }
}
