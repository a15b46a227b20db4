//! Contains the types needed to create and configure a [`Client`].

pub mod options;

use std::sync::Arc;

use bson::Document;
use tokio::sync::Mutex;

use crate::{
    cluster::{Cluster, Exchange},
    coll::{Collection, Namespace},
    concern::WriteConcern,
    db::Database,
    error::Result,
    selection_criteria::ReadPreference,
    wire::Rpc,
};

use self::options::ClientOptions;

/// The lifetime root of the driver: owns the cluster and hands out database
/// and collection handles that borrow it cheaply.
///
/// `Client` uses `Arc` internally, so it can be cloned and shared freely. At
/// most one operation is in the cluster at a time; concurrent callers queue
/// on an internal lock, preserving request/response ordering per connection.
///
/// No connection is made until the first operation runs.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    cluster: Mutex<Cluster>,
    options: ClientOptions,
}

impl Client {
    /// Creates a client from a connection string.
    pub fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        Self::with_options(ClientOptions::parse(uri)?)
    }

    /// Creates a client with the given options.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        let cluster = Cluster::new(options.clone())?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                cluster: Mutex::new(cluster),
                options,
            }),
        })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Gets a handle to the named database.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name.to_string())
    }

    /// Gets a handle to the database named by the connection string, or
    /// `test` when none was given.
    pub fn default_database(&self) -> Database {
        let name = self
            .inner
            .options
            .default_database
            .as_deref()
            .unwrap_or("test");
        self.database(name)
    }

    /// Gets a handle to the collection addressed by a `db.coll` namespace.
    pub fn collection(&self, ns: &str) -> Result<Collection> {
        let ns = Namespace::parse(ns)?;
        Ok(Collection::new(self.clone(), ns, None, None))
    }

    /// Routes a message batch through the cluster and reads the correlated
    /// reply when the batch calls for one.
    pub(crate) async fn operate(
        &self,
        rpcs: &mut [Rpc<'_>],
        hint: u32,
        write_concern: Option<&WriteConcern>,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<Exchange> {
        self.inner
            .cluster
            .lock()
            .await
            .operate(rpcs, hint, write_concern, read_prefs)
            .await
    }

    /// Runs a command against `db.$cmd` and interprets the reply.
    pub(crate) async fn run_command(
        &self,
        db: &str,
        command: &Document,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<Document> {
        self.inner
            .cluster
            .lock()
            .await
            .command(db, command, read_prefs)
            .await
    }

    pub(crate) async fn run_command_with_hint(
        &self,
        db: &str,
        command: &Document,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<(u32, Document)> {
        self.inner
            .cluster
            .lock()
            .await
            .command_with_hint(db, command, read_prefs)
            .await
    }

    /// The stamp of the node behind a hint; used by cursors to detect that
    /// their connection was replaced.
    pub(crate) async fn stamp(&self, hint: u32) -> u32 {
        self.inner.cluster.lock().await.stamp(hint)
    }

    pub(crate) async fn wire_version(&self) -> i32 {
        self.inner.cluster.lock().await.wire_version()
    }

    pub(crate) async fn max_bson_size(&self) -> i32 {
        self.inner.cluster.lock().await.max_bson_size()
    }

    /// Releases a server-side cursor, fire-and-forget.
    pub(crate) async fn kill_cursor(&self, hint: u32, cursor_id: i64) -> Result<()> {
        self.inner
            .cluster
            .lock()
            .await
            .kill_cursors(hint, vec![cursor_id])
            .await
    }

    /// Forces the cluster to establish its connections now instead of on the
    /// first operation.
    pub async fn warm_up(&self) -> Result<()> {
        self.inner.cluster.lock().await.ensure_connected().await
    }
}
