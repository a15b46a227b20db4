use bson::{Bson, Document, RawDocument};
use serde::de::DeserializeOwned;

use crate::{
    error::{Error, ErrorKind, Result},
    wire::{GetMore, Rpc, RpcBody},
    Client,
};

use super::{current_document, kill_server_cursor, DocWindow};

/// A cursor over a command reply of the form
/// `{cursor: {id, ns, firstBatch: [...]}}`.
///
/// The inline first batch is drained before regular GET_MORE iteration takes
/// over, using the id and namespace the server returned.
#[derive(Debug)]
pub struct CommandCursor {
    client: Client,
    ns: String,
    batch_size: i32,
    hint: u32,
    stamp: u32,
    cursor_id: i64,
    docs: Vec<u8>,
    window: DocWindow,
    done: bool,
    error: Option<Error>,
}

impl CommandCursor {
    pub(crate) async fn from_command_reply(
        client: Client,
        hint: u32,
        reply: &Document,
        batch_size: i32,
    ) -> Result<Self> {
        let cursor_doc = reply.get_document("cursor").map_err(|_| {
            Error::invalid_response("command reply is missing the cursor document")
        })?;

        let cursor_id = match cursor_doc.get("id") {
            Some(Bson::Int64(id)) => *id,
            Some(Bson::Int32(id)) => *id as i64,
            _ => return Err(Error::invalid_response("cursor document is missing its id")),
        };
        let ns = cursor_doc
            .get_str("ns")
            .map_err(|_| Error::invalid_response("cursor document is missing its namespace"))?
            .to_string();

        let mut docs = Vec::new();
        let first_batch = cursor_doc.get_array("firstBatch").map_err(|_| {
            Error::invalid_response("cursor document is missing its first batch")
        })?;
        for item in first_batch {
            match item {
                Bson::Document(doc) => docs.extend(bson::to_vec(doc)?),
                _ => {
                    return Err(Error::invalid_response(
                        "cursor first batch contains a non-document entry",
                    ))
                }
            }
        }

        let stamp = client.stamp(hint).await;
        Ok(Self {
            client,
            ns,
            batch_size,
            hint,
            stamp,
            cursor_id,
            docs,
            window: DocWindow::default(),
            done: false,
            error: None,
        })
    }

    /// Moves the cursor forward, returning whether a new document is
    /// available through [`current`](CommandCursor::current).
    pub async fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        loop {
            if self.window.exhausted(&self.docs) && self.cursor_id != 0 {
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
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
    }

    /// The document the cursor is positioned at.
    ///
    /// Panics unless the last [`advance`](CommandCursor::advance) returned
    /// `true`.
    pub fn current(&self) -> &RawDocument {
        current_document(&self.docs, &self.window)
    }

    /// Deserializes [`current`](CommandCursor::current) into `T`.
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

    /// Whether another document might exist.
    pub fn has_more(&self) -> bool {
        !self.done && (self.cursor_id != 0 || !self.window.exhausted(&self.docs))
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

        let exchange = self.client.operate(&mut batch, self.hint, None, None).await?;
        let reply = exchange
            .reply
            .ok_or_else(|| Error::internal("GET_MORE exchange produced no reply"))?;
        reply.check_failure_flags()?;

        self.cursor_id = reply.cursor_id;
        self.docs = reply.documents;
        self.window = DocWindow::default();
        Ok(())
    }
}

impl Drop for CommandCursor {
    fn drop(&mut self) {
        kill_server_cursor(&self.client, self.hint, self.cursor_id);
    }
}
