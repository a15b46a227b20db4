//! An embeddable MongoDB client speaking the legacy wire protocol.
//!
//! The driver connects to standalone servers, replica sets, and sharded
//! clusters over TCP or UNIX domain sockets, optionally through TLS, and
//! exposes collections of BSON documents: queries with lazy batched cursors,
//! inserts, updates, deletes, and aggregations, with write acknowledgement
//! through getLastError and read routing by read preference.
//!
//! ```no_run
//! use bson::doc;
//! use mongodb_legacy::{error::Result, Client, InsertFlags};
//!
//! # async fn run() -> Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/inventory")?;
//! let items = client.collection("inventory.items")?;
//!
//! items
//!     .insert(InsertFlags::empty(), &doc! { "name": "widget", "qty": 5 }, None)
//!     .await?;
//!
//! let mut cursor = items.find(doc! { "qty": { "$gt": 1 } })?;
//! while cursor.advance().await? {
//!     println!("{:?}", cursor.current());
//! }
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(clippy::unreadable_literal, clippy::match_like_matches_macro)
)]

pub use ::bson;

mod bson_util;
mod buffer;
mod client;
mod cluster;
mod coll;
mod concern;
mod cursor;
mod db;
pub mod error;
mod runtime;
mod scanner;
mod selection_criteria;
mod wire;

pub use crate::{
    client::{
        options::{ClientOptions, Credential, ServerAddress, TlsOptions},
        Client,
    },
    coll::{
        options::{AggregateOptions, FindOptions, IndexOptions},
        AggregateCursor,
        Collection,
        Namespace,
    },
    concern::{Acknowledgment, WriteConcern},
    cursor::{ArrayCursor, CommandCursor, Cursor},
    db::Database,
    selection_criteria::{ReadPreference, TagSet},
    wire::{DeleteFlags, InsertFlags, QueryFlags, UpdateFlags},
};
