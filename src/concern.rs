//! Contains the type for write concerns.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

/// Specifies the level of acknowledgement requested from the server for write
/// operations.
///
/// After an acknowledged write the driver issues a getLastError query built
/// from this concern and reads back one reply.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a
    /// specific number or variety of servers.
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit, in milliseconds, for the write concern. The
    /// server does not roll back writes that occurred before the timeout.
    #[serde(rename = "wtimeout")]
    pub w_timeout: Option<i32>,

    /// Requests acknowledgement that the operation has propagated to the
    /// on-disk journal.
    #[serde(rename = "j")]
    pub journal: Option<bool>,

    /// Requests that the server sync files to disk before acknowledging.
    pub fsync: Option<bool>,
}

/// The type of the `w` field in a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified
    /// number of nodes. Zero requests no acknowledgement at all.
    Nodes(i32),
    /// Requires acknowledgement that the write has reached the majority of
    /// nodes.
    Majority,
    /// Requires acknowledgement according to the given custom write mode.
    Tag(String),
}

impl From<i32> for Acknowledgment {
    fn from(i: i32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Tag(s)
        }
    }
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Nodes(n) => n.serialize(serializer),
            Acknowledgment::Majority => "majority".serialize(serializer),
            Acknowledgment::Tag(tag) => tag.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        match Bson::deserialize(deserializer)? {
            Bson::Int32(i) => Ok(Acknowledgment::Nodes(i)),
            Bson::Int64(i) => Ok(Acknowledgment::Nodes(i as i32)),
            Bson::String(s) => Ok(Acknowledgment::from(s)),
            other => Err(serde::de::Error::custom(format!(
                "invalid type for write concern w: {:?}",
                other
            ))),
        }
    }
}

impl Acknowledgment {
    fn to_bson(&self) -> Bson {
        match self {
            Acknowledgment::Nodes(n) => Bson::Int32(*n),
            Acknowledgment::Majority => Bson::String("majority".to_string()),
            Acknowledgment::Tag(tag) => Bson::String(tag.clone()),
        }
    }
}

impl WriteConcern {
    /// Whether the server must acknowledge writes performed under this
    /// concern. `w: 0` is the only fire-and-forget configuration.
    pub fn requires_acknowledgment(&self) -> bool {
        if self.journal == Some(true) || self.fsync == Some(true) {
            return true;
        }
        !matches!(self.w, Some(Acknowledgment::Nodes(0)))
    }

    /// The getLastError selector sent after an acknowledged write.
    pub(crate) fn to_gle_document(&self) -> Document {
        let mut gle = doc! { "getLastError": 1 };
        if let Some(ref w) = self.w {
            gle.insert("w", w.to_bson());
        }
        if let Some(w_timeout) = self.w_timeout {
            gle.insert("wtimeout", w_timeout);
        }
        if let Some(journal) = self.journal {
            gle.insert("j", journal);
        }
        if let Some(fsync) = self.fsync {
            gle.insert("fsync", fsync);
        }
        gle
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::{Acknowledgment, WriteConcern};

    #[test]
    fn gle_document_shape() {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Nodes(1))
            .w_timeout(100)
            .build();
        assert_eq!(
            wc.to_gle_document(),
            doc! { "getLastError": 1, "w": 1, "wtimeout": 100 }
        );
    }

    #[test]
    fn unacknowledged_requires_no_readback() {
        let wc = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
        assert!(!wc.requires_acknowledgment());

        // Journaling forces acknowledgement even with w: 0.
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Nodes(0))
            .journal(true)
            .build();
        assert!(wc.requires_acknowledgment());

        assert!(WriteConcern::default().requires_acknowledgment());
        let majority = WriteConcern::builder().w(Acknowledgment::Majority).build();
        assert!(majority.requires_acknowledgment());
    }
}
