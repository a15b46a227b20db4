//! Read preferences: which nodes may serve a read.

use std::collections::HashMap;

use crate::error::{ErrorKind, Result};

/// Specifies how the driver routes a read operation to members of a replica
/// set.
///
/// If applicable, `tag_sets` can be used to target specific nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    #[default]
    Primary,
    /// Only route this operation to a secondary.
    Secondary {
        /// Tag sets constraining eligible secondaries.
        tag_sets: Option<Vec<TagSet>>,
    },
    /// Route this operation to the primary if it's available, but fall back
    /// to the secondaries if not.
    PrimaryPreferred {
        /// Tag sets constraining eligible fallback nodes.
        tag_sets: Option<Vec<TagSet>>,
    },
    /// Route this operation to a secondary if one is available, but fall back
    /// to the primary if not.
    SecondaryPreferred {
        /// Tag sets constraining eligible secondaries.
        tag_sets: Option<Vec<TagSet>>,
    },
    /// Route this operation to the node with the least network latency
    /// regardless of whether it's the primary or a secondary.
    Nearest {
        /// Tag sets constraining eligible nodes.
        tag_sets: Option<Vec<TagSet>>,
    },
}

/// A read preference tag set. A node is eligible under a tag set when every
/// key/value pair in the set appears in the node's tags; a node is eligible
/// under a preference when any one of its tag sets matches.
pub type TagSet = HashMap<String, String>;

impl ReadPreference {
    pub(crate) fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let tag_sets = Some(tag_sets);

        let read_pref = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary mode \
                              is specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { .. } => ReadPreference::Secondary { tag_sets },
            ReadPreference::PrimaryPreferred { .. } => {
                ReadPreference::PrimaryPreferred { tag_sets }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                ReadPreference::SecondaryPreferred { tag_sets }
            }
            ReadPreference::Nearest { .. } => ReadPreference::Nearest { tag_sets },
        };

        Ok(read_pref)
    }

    /// Whether a query routed under this preference may set the slave-OK wire
    /// flag.
    pub(crate) fn is_secondary_ok(&self) -> bool {
        !matches!(self, ReadPreference::Primary)
    }

    /// Whether only the primary may serve the operation.
    pub(crate) fn requires_primary(&self) -> bool {
        matches!(self, ReadPreference::Primary)
    }

    pub(crate) fn tag_sets(&self) -> Option<&[TagSet]> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { tag_sets }
            | ReadPreference::PrimaryPreferred { tag_sets }
            | ReadPreference::SecondaryPreferred { tag_sets }
            | ReadPreference::Nearest { tag_sets } => tag_sets.as_deref(),
        }
    }

    /// Whether a node carrying `tags` is eligible under this preference's tag
    /// sets. Each tag set is a strict AND over its pairs; sets are OR-ed.
    pub(crate) fn tags_match(&self, tags: &TagSet) -> bool {
        match self.tag_sets() {
            None => true,
            Some([]) => true,
            Some(tag_sets) => tag_sets.iter().any(|set| {
                set.iter()
                    .all(|(key, value)| tags.get(key).map(|v| v == value).unwrap_or(false))
            }),
        }
    }
}
