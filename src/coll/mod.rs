//! Collection-level operations: CRUD message builders and command wrappers.

pub mod options;

use std::{fmt, sync::Mutex};

use bson::{doc, Bson, Document};

use crate::{
    concern::WriteConcern,
    cursor::{ArrayCursor, CommandCursor, Cursor},
    error::{Error, ErrorKind, Result, WriteError},
    selection_criteria::ReadPreference,
    wire::{Delete, DeleteFlags, Insert, InsertFlags, QueryFlags, Rpc, RpcBody, Update, UpdateFlags},
    Client,
};

use self::options::{AggregateOptions, FindOptions, IndexOptions};

const NAMESPACE_MAX: usize = 120;

/// A `database.collection` pair, validated against the server's namespace
/// rules.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Namespace {
    /// The database name.
    pub db: String,
    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Validates and splits a `db.collection` string.
    pub fn parse(ns: &str) -> Result<Self> {
        let (db, coll) = ns.split_once('.').ok_or_else(|| invalid_namespace(ns))?;
        if db.is_empty()
            || coll.is_empty()
            || db.contains([' ', '$', '/', '\\', '\0'])
            || coll.contains('\0')
            || ns.len() > NAMESPACE_MAX
        {
            return Err(invalid_namespace(ns));
        }
        Ok(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

fn invalid_namespace(ns: &str) -> Error {
    Error::new(ErrorKind::InvalidNamespace {
        message: format!("\"{}\" is not a valid namespace", ns),
    })
}

/// A handle to a collection on the deployment.
///
/// Operations build wire messages and route them through the owning client's
/// cluster. Writes are acknowledged through getLastError according to the
/// effective write concern.
#[derive(Debug)]
pub struct Collection {
    client: Client,
    ns: Namespace,
    write_concern: Option<WriteConcern>,
    read_preference: Option<ReadPreference>,
    last_gle: Mutex<Option<Document>>,
}

impl Collection {
    pub(crate) fn new(
        client: Client,
        ns: Namespace,
        write_concern: Option<WriteConcern>,
        read_preference: Option<ReadPreference>,
    ) -> Self {
        Self {
            client,
            ns,
            write_concern,
            read_preference,
            last_gle: Mutex::new(None),
        }
    }

    /// The collection's namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The acknowledgement document of the most recent acknowledged write
    /// through this handle.
    pub fn get_last_error(&self) -> Option<Document> {
        self.last_gle.lock().expect("gle mutex poisoned").clone()
    }

    fn effective_write_concern<'a>(
        &'a self,
        write_concern: Option<&'a WriteConcern>,
    ) -> WriteConcern {
        write_concern
            .or(self.write_concern.as_ref())
            .or(self.client.options().write_concern.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    fn effective_read_preference<'a>(
        &'a self,
        read_preference: Option<&'a ReadPreference>,
    ) -> Option<ReadPreference> {
        read_preference
            .or(self.read_preference.as_ref())
            .or(self.client.options().read_preference.as_ref())
            .cloned()
    }

    fn query_flags(&self, flags: QueryFlags, read_preference: Option<&ReadPreference>) -> QueryFlags {
        let secondary_ok = read_preference
            .map(ReadPreference::is_secondary_ok)
            .unwrap_or(false)
            || self.client.options().slave_ok == Some(true);
        if secondary_ok {
            flags | QueryFlags::SLAVE_OK
        } else {
            flags
        }
    }

    /// Inserts a document.
    pub async fn insert(
        &self,
        flags: InsertFlags,
        document: &Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        self.insert_bulk(flags, std::slice::from_ref(document), write_concern)
            .await
    }

    /// Inserts a batch of documents in a single message.
    pub async fn insert_bulk(
        &self,
        flags: InsertFlags,
        documents: &[Document],
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        if documents.is_empty() {
            return Err(Error::invalid_argument("no documents to insert"));
        }

        if !flags.contains(InsertFlags::NO_VALIDATE) {
            for document in documents {
                validate_document_keys(document)?;
            }
        }

        // Connections are lazy; the deployment's document size limit is only
        // known once the handshake has run.
        self.client.warm_up().await?;
        let max_bson_size = self.client.max_bson_size().await;
        let mut payloads = Vec::with_capacity(documents.len());
        for document in documents {
            let bytes = bson::to_vec(document)?;
            if bytes.len() as i64 > max_bson_size as i64 {
                return Err(ErrorKind::MessageSize {
                    message: format!(
                        "document of {} bytes exceeds the deployment limit of {}",
                        bytes.len(),
                        max_bson_size
                    ),
                }
                .into());
            }
            payloads.push(bytes);
        }

        let namespace = self.ns.to_string();
        let mut batch = [Rpc::new(RpcBody::Insert(Insert {
            flags,
            namespace: &namespace,
            documents: payloads.iter().map(Vec::as_slice).collect(),
        }))];

        let write_concern = self.effective_write_concern(write_concern);
        let exchange = self
            .client
            .operate(&mut batch, 0, Some(&write_concern), None)
            .await?;
        self.check_write_acknowledgement(exchange.reply)
    }

    /// Updates documents matching `selector`.
    pub async fn update(
        &self,
        flags: UpdateFlags,
        selector: &Document,
        update: &Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        if !flags.contains(UpdateFlags::NO_VALIDATE) {
            // An update whose first key is an operator ($set, $inc, ...) is
            // validated by the server; a replacement document is validated
            // like an insert.
            let is_operator_update = update.keys().next().map(|k| k.starts_with('$'));
            if is_operator_update != Some(true) {
                validate_document_keys(update)?;
            }
        }

        let namespace = self.ns.to_string();
        let selector_bytes = bson::to_vec(selector)?;
        let update_bytes = bson::to_vec(update)?;
        let mut batch = [Rpc::new(RpcBody::Update(Update {
            namespace: &namespace,
            flags,
            selector: &selector_bytes,
            update: &update_bytes,
        }))];

        let write_concern = self.effective_write_concern(write_concern);
        let exchange = self
            .client
            .operate(&mut batch, 0, Some(&write_concern), None)
            .await?;
        self.check_write_acknowledgement(exchange.reply)
    }

    /// Deletes documents matching `selector`.
    pub async fn delete(
        &self,
        flags: DeleteFlags,
        selector: &Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        let namespace = self.ns.to_string();
        let selector_bytes = bson::to_vec(selector)?;
        let mut batch = [Rpc::new(RpcBody::Delete(Delete {
            namespace: &namespace,
            flags,
            selector: &selector_bytes,
        }))];

        let write_concern = self.effective_write_concern(write_concern);
        let exchange = self
            .client
            .operate(&mut batch, 0, Some(&write_concern), None)
            .await?;
        self.check_write_acknowledgement(exchange.reply)
    }

    /// Inserts `document`, or updates the existing document sharing its
    /// `_id`.
    pub async fn save(
        &self,
        document: &Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        match document.get("_id") {
            None => self.insert(InsertFlags::empty(), document, write_concern).await,
            Some(id) => {
                let selector = doc! { "_id": id.clone() };
                let update = doc! { "$set": document.clone() };
                self.update(UpdateFlags::UPSERT, &selector, &update, write_concern)
                    .await
            }
        }
    }

    /// Begins a query for the documents matching `filter`. No network traffic
    /// occurs until the cursor is first advanced.
    pub fn find(&self, filter: Document) -> Result<Cursor> {
        self.find_with_options(filter, FindOptions::default())
    }

    /// [`find`](Collection::find) with explicit options.
    pub fn find_with_options(&self, filter: Document, options: FindOptions) -> Result<Cursor> {
        let read_preference = self.effective_read_preference(options.read_preference.as_ref());
        let flags = self.query_flags(options.flags, read_preference.as_ref());
        let fields = match options.projection {
            Some(ref projection) => Some(bson::to_vec(projection)?),
            None => None,
        };

        Ok(Cursor::new(
            self.client.clone(),
            self.ns.to_string(),
            flags,
            options.skip,
            options.limit,
            options.batch_size,
            bson::to_vec(&filter)?,
            fields,
            read_preference,
        ))
    }

    /// Counts the documents matching `query`.
    pub async fn count(&self, query: Document) -> Result<i64> {
        let command = doc! { "count": &self.ns.coll, "query": query };
        let reply = self.run_command(command, None).await?;
        reply
            .get("n")
            .and_then(crate::bson_util::as_i64)
            .ok_or_else(|| Error::invalid_response("count reply is missing its total"))
    }

    /// Runs an aggregation pipeline.
    ///
    /// Servers that support command cursors stream batches through a
    /// [`CommandCursor`]; older servers inline every result document.
    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<AggregateCursor> {
        let read_preference = self.effective_read_preference(options.read_preference.as_ref());
        let pipeline = pipeline.into_iter().map(Bson::Document).collect::<Vec<_>>();

        // The cursor-vs-inline decision depends on the wire version learned
        // during the handshake.
        self.client.warm_up().await?;
        if self.client.wire_version().await > 0 {
            let cursor_options = if options.batch_size != 0 {
                doc! { "batchSize": options.batch_size }
            } else {
                doc! {}
            };
            let command = doc! {
                "aggregate": &self.ns.coll,
                "pipeline": pipeline,
                "cursor": cursor_options,
            };
            let (hint, reply) = self
                .client
                .run_command_with_hint(&self.ns.db, &command, read_preference.as_ref())
                .await?;
            let cursor = CommandCursor::from_command_reply(
                self.client.clone(),
                hint,
                &reply,
                options.batch_size,
            )
            .await?;
            Ok(AggregateCursor::Command(cursor))
        } else {
            let command = doc! { "aggregate": &self.ns.coll, "pipeline": pipeline };
            let reply = self
                .client
                .run_command(&self.ns.db, &command, read_preference.as_ref())
                .await?;
            Ok(AggregateCursor::Array(ArrayCursor::from_command_reply(
                &reply, "result",
            )?))
        }
    }

    /// Drops the collection.
    pub async fn drop(&self) -> Result<()> {
        self.run_command(doc! { "drop": &self.ns.coll }, None).await?;
        Ok(())
    }

    /// Drops the named index.
    pub async fn drop_index(&self, index_name: &str) -> Result<()> {
        let command = doc! { "dropIndexes": &self.ns.coll, "index": index_name };
        self.run_command(command, None).await?;
        Ok(())
    }

    /// Requests creation of an index over `keys` by inserting its
    /// description into the database's `system.indexes` collection.
    pub async fn ensure_index(&self, keys: Document, options: IndexOptions) -> Result<()> {
        let name = match options.name {
            Some(ref name) => name.clone(),
            None => keys_to_index_string(&keys),
        };

        let mut description = doc! {
            "key": keys,
            "ns": self.ns.to_string(),
            "name": name,
        };
        if let Some(background) = options.background {
            description.insert("background", background);
        }
        if let Some(unique) = options.unique {
            description.insert("unique", unique);
        }
        if let Some(drop_dups) = options.drop_dups {
            description.insert("dropDups", drop_dups);
        }
        if let Some(sparse) = options.sparse {
            description.insert("sparse", sparse);
        }
        if let Some(expire_after_seconds) = options.expire_after_seconds {
            description.insert("expireAfterSeconds", expire_after_seconds);
        }

        let system_indexes = Collection::new(
            self.client.clone(),
            Namespace {
                db: self.ns.db.clone(),
                coll: "system.indexes".to_string(),
            },
            self.write_concern.clone(),
            None,
        );
        system_indexes
            .insert(InsertFlags::NO_VALIDATE, &description, None)
            .await
    }

    /// Runs the server's `validate` command against the collection.
    pub async fn validate(&self, options: Option<Document>) -> Result<Document> {
        let mut command = doc! { "validate": &self.ns.coll };
        if let Some(options) = options {
            for (key, value) in options {
                command.insert(key, value);
            }
        }
        self.run_command(command, None).await
    }

    async fn run_command(
        &self,
        command: Document,
        read_preference: Option<&ReadPreference>,
    ) -> Result<Document> {
        let read_preference = self.effective_read_preference(read_preference);
        self.client
            .run_command(&self.ns.db, &command, read_preference.as_ref())
            .await
    }

    /// Interprets the getLastError reply of an acknowledged write. A
    /// non-null `err` is a failed write; the reply is retained either way.
    fn check_write_acknowledgement(
        &self,
        reply: Option<crate::wire::OwnedReply>,
    ) -> Result<()> {
        let reply = match reply {
            Some(reply) => reply,
            None => return Ok(()),
        };
        reply.check_failure_flags()?;

        let raw = reply
            .first_document()?
            .ok_or_else(|| Error::invalid_response("getLastError reply carried no document"))?;
        let gle: Document = bson::from_slice(raw.as_bytes())?;

        let failure = match gle.get("err") {
            Some(Bson::String(err)) => Some(WriteError {
                code: gle.get_i32("code").unwrap_or(0),
                message: err.clone(),
            }),
            _ => None,
        };

        *self.last_gle.lock().expect("gle mutex poisoned") = Some(gle);

        match failure {
            Some(write_error) => Err(Error::new(ErrorKind::Write(write_error))),
            None => Ok(()),
        }
    }
}

/// A cursor over aggregation results, batched or inline depending on the
/// server's wire version.
#[derive(Debug)]
pub enum AggregateCursor {
    /// Batched results via a server-side command cursor.
    Command(CommandCursor),
    /// Every result inlined in the command reply.
    Array(ArrayCursor),
}

impl AggregateCursor {
    /// Moves the cursor forward, returning whether a new document is
    /// available through [`current`](AggregateCursor::current).
    pub async fn advance(&mut self) -> Result<bool> {
        match self {
            Self::Command(cursor) => cursor.advance().await,
            Self::Array(cursor) => cursor.advance(),
        }
    }

    /// The document the cursor is positioned at.
    pub fn current(&self) -> &bson::RawDocument {
        match self {
            Self::Command(cursor) => cursor.current(),
            Self::Array(cursor) => cursor.current(),
        }
    }

    /// Moves forward and returns the next document, owned.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        match self.advance().await {
            Ok(true) => Some(
                bson::from_slice(self.current().as_bytes()).map_err(crate::error::Error::from),
            ),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

/// Derives the server's conventional index name from its keys:
/// `{a: 1, b: -1}` becomes `a_1_b_-1`.
fn keys_to_index_string(keys: &Document) -> String {
    keys.iter()
        .map(|(key, value)| {
            let order = match value {
                Bson::Int32(i) => *i as i64,
                Bson::Int64(i) => *i,
                Bson::Double(d) => *d as i64,
                _ => 1,
            };
            format!("{}_{}", key, order)
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Rejects document keys the server would store but never let a query reach:
/// operator-prefixed names and dotted paths. DBRef keys are allowed.
fn validate_document_keys(document: &Document) -> Result<()> {
    for (key, value) in document {
        if key.starts_with('$') && !matches!(key.as_str(), "$ref" | "$id" | "$db") {
            return Err(Error::invalid_argument(format!(
                "document key \"{}\" must not start with '$'",
                key
            )));
        }
        if key.contains('.') {
            return Err(Error::invalid_argument(format!(
                "document key \"{}\" must not contain '.'",
                key
            )));
        }
        match value {
            Bson::Document(sub) => validate_document_keys(sub)?,
            Bson::Array(items) => {
                for item in items {
                    if let Bson::Document(sub) = item {
                        validate_document_keys(sub)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::{keys_to_index_string, validate_document_keys, Namespace};

    #[test]
    fn namespace_parsing() {
        let ns = Namespace::parse("db.coll").unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "coll");
        assert_eq!(ns.to_string(), "db.coll");

        // Collections may themselves contain dots.
        let ns = Namespace::parse("db.system.indexes").unwrap();
        assert_eq!(ns.coll, "system.indexes");

        Namespace::parse("nodot").unwrap_err();
        Namespace::parse(".coll").unwrap_err();
        Namespace::parse("db.").unwrap_err();
        Namespace::parse("bad db.coll").unwrap_err();
        Namespace::parse(&format!("db.{}", "x".repeat(200))).unwrap_err();
    }

    #[test]
    fn key_validation() {
        validate_document_keys(&doc! { "a": 1, "nested": { "b": 2 } }).unwrap();
        validate_document_keys(&doc! { "ref": { "$ref": "c", "$id": 5 } }).unwrap();

        validate_document_keys(&doc! { "$set": { "a": 1 } }).unwrap_err();
        validate_document_keys(&doc! { "a.b": 1 }).unwrap_err();
        validate_document_keys(&doc! { "nested": { "$gt": 1 } }).unwrap_err();
        validate_document_keys(&doc! { "items": [{ "a.b": 1 }] }).unwrap_err();
    }

    #[test]
    fn index_names_follow_key_order() {
        assert_eq!(
            keys_to_index_string(&doc! { "a": 1, "b": -1 }),
            "a_1_b_-1"
        );
        assert_eq!(keys_to_index_string(&doc! { "geo": "2d" }), "geo_1");
    }
}
