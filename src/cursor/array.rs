use bson::{Bson, Document, RawDocument};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

use super::{current_document, DocWindow};

/// A cursor over a command reply that inlines every result document in an
/// array field, e.g. `{result: [...]}` from pre-cursor aggregations.
///
/// There is no server-side state: iteration never touches the network.
#[derive(Debug)]
pub struct ArrayCursor {
    docs: Vec<u8>,
    window: DocWindow,
    done: bool,
}

impl ArrayCursor {
    pub(crate) fn from_command_reply(reply: &Document, field: &str) -> Result<Self> {
        let items = reply.get_array(field).map_err(|_| {
            Error::invalid_response(format!("command reply is missing the {} array", field))
        })?;

        let mut docs = Vec::new();
        for item in items {
            match item {
                Bson::Document(doc) => docs.extend(bson::to_vec(doc)?),
                _ => {
                    return Err(Error::invalid_response(format!(
                        "{} array contains a non-document entry",
                        field
                    )))
                }
            }
        }

        Ok(Self {
            docs,
            window: DocWindow::default(),
            done: false,
        })
    }

    /// Moves the cursor forward, returning whether a new document is
    /// available through [`current`](ArrayCursor::current).
    pub fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let advanced = self.window.advance(&self.docs)?;
        if !advanced {
            self.done = true;
        }
        Ok(advanced)
    }

    /// The document the cursor is positioned at.
    ///
    /// Panics unless the last [`advance`](ArrayCursor::advance) returned
    /// `true`.
    pub fn current(&self) -> &RawDocument {
        current_document(&self.docs, &self.window)
    }

    /// Deserializes [`current`](ArrayCursor::current) into `T`.
    pub fn deserialize_current<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bson::from_slice(self.current().as_bytes())?)
    }

    /// Moves forward and returns the next document, owned.
    pub fn next_document(&mut self) -> Option<Result<Document>> {
        match self.advance() {
            Ok(true) => Some(self.deserialize_current()),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }

    /// Whether another document might exist.
    pub fn has_more(&self) -> bool {
        !self.done && !self.window.exhausted(&self.docs)
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::ArrayCursor;

    #[test]
    fn drains_the_inline_array() {
        let reply = doc! {
            "result": [ { "_id": 1 }, { "_id": 2 } ],
            "ok": 1.0,
        };

        let mut cursor = ArrayCursor::from_command_reply(&reply, "result").unwrap();
        let mut ids = Vec::new();
        while let Some(doc) = cursor.next_document() {
            ids.push(doc.unwrap().get_i32("_id").unwrap());
        }
        assert_eq!(ids, vec![1, 2]);
        assert!(!cursor.has_more());
    }

    #[test]
    fn rejects_malformed_replies() {
        ArrayCursor::from_command_reply(&doc! { "ok": 1.0 }, "result").unwrap_err();
        ArrayCursor::from_command_reply(&doc! { "result": [1, 2] }, "result").unwrap_err();
    }
}
