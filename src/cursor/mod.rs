//! Lazy iteration over query results.

mod array;
mod cursorid;

use std::ops::Range;

use bson::{Document, RawDocument};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    error::{Error, ErrorKind, Result},
    selection_criteria::ReadPreference,
    wire::{split_first_document, GetMore, OwnedReply, Query, QueryFlags, Rpc, RpcBody},
    Client,
};

pub use self::{array::ArrayCursor, cursorid::CommandCursor};

/// A cursor over the documents matching a query.
///
/// The query is sent lazily on the first [`advance`](Cursor::advance); as the
/// caller drains each batch, the cursor issues GET_MORE against the node that
/// answered the query until the server reports an exhausted cursor id.
///
/// ```no_run
/// # use mongodb_legacy::{Client, error::Result};
/// # use bson::doc;
/// # async fn run() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://localhost:27017")?;
/// let collection = client.collection("db.items")?;
/// let mut cursor = collection.find(doc! { "qty": { "$gt": 4 } })?;
/// while cursor.advance().await? {
///     println!("{:?}", cursor.current());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Cursor {
    client: Client,
    ns: String,
    flags: QueryFlags,
    skip: i32,
    limit: i32,
    batch_size: i32,
    query: Vec<u8>,
    fields: Option<Vec<u8>>,
    read_prefs: Option<ReadPreference>,

    /// 1-based index of the node serving this cursor; zero until bound.
    hint: u32,
    /// The serving node's stamp at bind time; a mismatch on GET_MORE means
    /// the connection underneath was replaced.
    stamp: u32,
    cursor_id: i64,
    docs: Vec<u8>,
    window: DocWindow,
    sent: bool,
    done: bool,
    error: Option<Error>,
}

impl Cursor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: Client,
        ns: String,
        flags: QueryFlags,
        skip: i32,
        limit: i32,
        batch_size: i32,
        query: Vec<u8>,
        fields: Option<Vec<u8>>,
        read_prefs: Option<ReadPreference>,
    ) -> Self {
        Self {
            client,
            ns,
            flags,
            skip,
            limit,
            batch_size,
            query,
            fields,
            read_prefs,
            hint: 0,
            stamp: 0,
            cursor_id: 0,
            docs: Vec::new(),
            window: DocWindow::default(),
            sent: false,
            done: false,
            error: None,
        }
    }

    /// Moves the cursor forward, returning whether a new document is
    /// available through [`current`](Cursor::current).
    pub async fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        loop {
            if !self.sent {
                if let Err(error) = self.execute_query().await {
                    return Err(self.fail(error));
                }
            } else if self.window.exhausted(&self.docs) {
                if self.cursor_id == 0 {
                    self.done = true;
                    return Ok(false);
                }
                if let Err(error) = self.execute_get_more().await {
                    return Err(self.fail(error));
                }
            }

            match self.window.advance(&self.docs) {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    if self.cursor_id == 0 {
                        self.done = true;
                        return Ok(false);
                    }
                    // Batch drained with a live server-side cursor; loop
                    // around into a GET_MORE.
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
    }

    /// The document the cursor is positioned at.
    ///
    /// Panics unless the last [`advance`](Cursor::advance) returned `true`.
    /// The reference is valid until the next `advance` call.
    pub fn current(&self) -> &RawDocument {
        current_document(&self.docs, &self.window)
    }

    /// Deserializes [`current`](Cursor::current) into `T`.
    pub fn deserialize_current<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bson::from_slice(self.current().as_bytes())?)
    }

    /// Moves forward and returns the next document, owned.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        match self.advance().await {
            Ok(true) => Some(self.deserialize_current()),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }

    /// Adapts the cursor into a [`futures_core::Stream`] of owned documents.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = Result<Document>> {
        futures_util::stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|item| (item, cursor))
        })
    }

    /// Whether another document might exist.
    pub fn has_more(&self) -> bool {
        !self.done && (!self.sent || self.cursor_id != 0 || !self.window.exhausted(&self.docs))
    }

    /// The sticky error, if iteration has failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn fail(&mut self, error: Error) -> Error {
        self.error = Some(error.clone());
        self.done = true;
        error
    }

    fn initial_n_return(&self) -> i32 {
        if self.limit == 0 {
            self.batch_size
        } else if self.batch_size == 0 {
            self.limit
        } else {
            self.limit.min(self.batch_size)
        }
    }

    async fn execute_query(&mut self) -> Result<()> {
        let mut batch = [Rpc::new(RpcBody::Query(Query {
            flags: self.flags,
            namespace: &self.ns,
            skip: self.skip,
            num_to_return: self.initial_n_return(),
            query: &self.query,
            fields: self.fields.as_deref(),
        }))];

        let exchange = self
            .client
            .operate(&mut batch, 0, None, self.read_prefs.as_ref())
            .await?;
        let reply = exchange
            .reply
            .ok_or_else(|| Error::internal("query exchange produced no reply"))?;
        reply.check_failure_flags()?;

        self.hint = exchange.hint;
        self.stamp = self.client.stamp(exchange.hint).await;
        self.install_reply(reply);
        self.sent = true;
        Ok(())
    }

    async fn execute_get_more(&mut self) -> Result<()> {
        if self.client.stamp(self.hint).await != self.stamp {
            return Err(ErrorKind::CursorNotFound {
                message: "the connection serving this cursor has been replaced".to_string(),
            }
            .into());
        }

        let mut batch = [Rpc::new(RpcBody::GetMore(GetMore {
            namespace: &self.ns,
            num_to_return: self.batch_size,
            cursor_id: self.cursor_id,
        }))];

        let exchange = self
            .client
            .operate(&mut batch, self.hint, None, self.read_prefs.as_ref())
            .await?;
        let reply = exchange
            .reply
            .ok_or_else(|| Error::internal("GET_MORE exchange produced no reply"))?;
        reply.check_failure_flags()?;

        self.install_reply(reply);
        Ok(())
    }

    fn install_reply(&mut self, reply: OwnedReply) {
        self.cursor_id = reply.cursor_id;
        self.docs = reply.documents;
        self.window = DocWindow::default();
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        kill_server_cursor(&self.client, self.hint, self.cursor_id);
    }
}

/// Releases a server-side cursor in the background, fire-and-forget.
pub(crate) fn kill_server_cursor(client: &Client, hint: u32, cursor_id: i64) {
    if cursor_id == 0 || hint == 0 {
        return;
    }
    let client = client.clone();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(error) = client.kill_cursor(hint, cursor_id).await {
                debug!(%error, cursor_id, "failed to kill server-side cursor");
            }
        });
    }
}

/// A sliding position over a concatenated document stream, tracking the byte
/// range of the current document.
#[derive(Debug, Default)]
struct DocWindow {
    offset: usize,
    current: Option<Range<usize>>,
}

impl DocWindow {
    fn exhausted(&self, bytes: &[u8]) -> bool {
        self.offset >= bytes.len()
    }

    /// Positions on the next document, validating its framing.
    fn advance(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.exhausted(bytes) {
            self.current = None;
            return Ok(false);
        }
        match split_first_document(&bytes[self.offset..]) {
            Ok(Some((doc, _))) => {
                let len = doc.as_bytes().len();
                self.current = Some(self.offset..self.offset + len);
                self.offset += len;
                Ok(true)
            }
            Ok(None) => {
                self.current = None;
                Ok(false)
            }
            Err(_) => Err(Error::invalid_response("the reply was corrupt")),
        }
    }
}

fn current_document<'a>(bytes: &'a [u8], window: &DocWindow) -> &'a RawDocument {
    let range = window
        .current
        .as_ref()
        .expect("advance() must return true before current() is called");
    RawDocument::from_bytes(&bytes[range.clone()])
        .expect("current document was validated during advance()")
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::DocWindow;

    fn stream(docs: &[bson::Document]) -> Vec<u8> {
        docs.iter()
            .flat_map(|doc| bson::to_vec(doc).unwrap())
            .collect()
    }

    #[test]
    fn window_walks_every_document() {
        let bytes = stream(&[doc! { "_id": 1 }, doc! { "_id": 2 }, doc! { "_id": 3 }]);
        let mut window = DocWindow::default();

        let mut ids = Vec::new();
        while window.advance(&bytes).unwrap() {
            ids.push(
                super::current_document(&bytes, &window)
                    .get_i32("_id")
                    .unwrap(),
            );
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(window.exhausted(&bytes));
    }

    #[test]
    fn window_reports_corrupt_streams() {
        let mut bytes = stream(&[doc! { "_id": 1 }, doc! { "_id": 2 }]);
        bytes.truncate(bytes.len() - 3);

        let mut window = DocWindow::default();
        assert!(window.advance(&bytes).unwrap());
        window.advance(&bytes).unwrap_err();
    }
}
