//! Identifiers for tree nodes, commands and trees.
//!
//! An id is a 64-bit value. Freshly issued ids are random; a handful of fixed
//! values act as well-known roots and sentinels. The textual form is unpadded
//! URL-safe base64 of the big-endian bytes, which keeps ids compact when
//! commands are serialized.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(i64);

impl Id {
    /// The value root. Always present in every tree and never removable.
    pub const ZERO: Id = Id(0);

    /// Optional metadata root, kept outside the value root's subtree.
    pub const MAX: Id = Id(i64::MAX);

    /// Sentinel used in list positions: "after EDGE" means first and
    /// "before EDGE" means last. Never a real node id.
    pub const EDGE: Id = Id(i64::MIN);

    /// Generates a new random id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        // Skip the reserved values. A collision with an existing node id is
        // ignored here; inserts reject on "Node already exists" instead.
        loop {
            let value: i64 = rng.gen();
            let id = Id(value);
            if id != Id::ZERO && id != Id::MAX && id != Id::EDGE {
                return id;
            }
        }
    }

    pub const fn from_bits(bits: i64) -> Id {
        Id(bits)
    }

    pub const fn bits(self) -> i64 {
        self.0
    }

    /// Renders the id as unpadded URL-safe base64.
    pub fn as_base64(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }

    /// Parses an id from the textual form produced by [`Id::as_base64`].
    pub fn parse_base64(text: &str) -> Option<Id> {
        let bytes = URL_SAFE_NO_PAD.decode(text).ok()?;
        let array: [u8; 8] = bytes.try_into().ok()?;
        Some(Id(i64::from_be_bytes(array)))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.as_base64())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_base64())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_base64())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Id::parse_base64(&text).ok_or_else(|| D::Error::custom("invalid id"))
    }
}
