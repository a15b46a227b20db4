//! Options for collection-level operations.

use bson::Document;
use typed_builder::TypedBuilder;

use crate::{selection_criteria::ReadPreference, wire::QueryFlags};

/// Options for [`Collection::find_with_options`](crate::Collection::find_with_options).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct FindOptions {
    /// Wire-level query flags (tailable, no-timeout, ...). The slave-OK bit
    /// is added automatically when the effective read preference allows
    /// secondaries.
    pub flags: QueryFlags,

    /// The number of matching documents to skip before returning results.
    pub skip: i32,

    /// The maximum number of documents the cursor yields; zero means no
    /// limit. A negative limit closes the cursor after one batch.
    pub limit: i32,

    /// The number of documents the server returns per batch.
    pub batch_size: i32,

    /// Limits the fields of the returned documents.
    #[builder(setter(strip_option))]
    pub projection: Option<Document>,

    /// Which nodes may serve this query; defaults to the collection's, then
    /// the client's preference.
    #[builder(setter(strip_option))]
    pub read_preference: Option<ReadPreference>,
}

/// Options for [`Collection::ensure_index`](crate::Collection::ensure_index).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct IndexOptions {
    /// Builds the index in the background.
    #[builder(setter(strip_option))]
    pub background: Option<bool>,

    /// Rejects documents that duplicate an indexed value.
    #[builder(setter(strip_option))]
    pub unique: Option<bool>,

    /// The index name; derived from the keys when unset.
    #[builder(setter(into, strip_option))]
    pub name: Option<String>,

    /// Drops duplicated documents while building a unique index.
    #[builder(setter(strip_option))]
    pub drop_dups: Option<bool>,

    /// Skips documents that lack the indexed fields.
    #[builder(setter(strip_option))]
    pub sparse: Option<bool>,

    /// Expires documents this many seconds after the indexed date field.
    #[builder(setter(strip_option))]
    pub expire_after_seconds: Option<i32>,
}

/// Options for [`Collection::aggregate`](crate::Collection::aggregate).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents the server returns per cursor batch.
    pub batch_size: i32,

    /// Which nodes may serve the aggregation.
    #[builder(setter(strip_option))]
    pub read_preference: Option<ReadPreference>,
}
