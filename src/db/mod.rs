//! Database-level operations.

use bson::{doc, Document};

use crate::{
    coll::{Collection, Namespace},
    concern::WriteConcern,
    cursor::Cursor,
    error::Result,
    selection_criteria::ReadPreference,
    Client,
};

/// A handle to a database on the deployment.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
    write_concern: Option<WriteConcern>,
    read_preference: Option<ReadPreference>,
}

impl Database {
    pub(crate) fn new(client: Client, name: String) -> Self {
        Self {
            client,
            name,
            write_concern: None,
            read_preference: None,
        }
    }

    /// The database's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets a handle to a collection in this database.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let ns = Namespace::parse(&format!("{}.{}", self.name, name))?;
        Ok(Collection::new(
            self.client.clone(),
            ns,
            self.write_concern.clone(),
            self.read_preference.clone(),
        ))
    }

    /// Runs a command and returns its reply document, surfacing `{ok: 0}`
    /// as a command error.
    pub async fn command_simple(&self, command: Document) -> Result<Document> {
        self.client
            .run_command(&self.name, &command, self.read_preference.as_ref())
            .await
    }

    /// Runs a command through the cursor machinery, for callers that want to
    /// inspect the raw reply lazily.
    pub fn command(&self, command: Document) -> Result<Cursor> {
        let ns = format!("{}.$cmd", self.name);
        Ok(Cursor::new(
            self.client.clone(),
            ns,
            crate::wire::QueryFlags::empty(),
            0,
            -1,
            0,
            bson::to_vec(&command)?,
            None,
            self.read_preference.clone(),
        ))
    }

    /// Creates a collection explicitly, with optional creation options
    /// (capped, size, ...).
    pub async fn create_collection(
        &self,
        name: &str,
        options: Option<Document>,
    ) -> Result<Collection> {
        let mut command = doc! { "create": name };
        if let Some(options) = options {
            for (key, value) in options {
                command.insert(key, value);
            }
        }
        self.command_simple(command).await?;
        self.collection(name)
    }

    /// Drops the database.
    pub async fn drop(&self) -> Result<()> {
        self.command_simple(doc! { "dropDatabase": 1 }).await?;
        Ok(())
    }
}
