use std::collections::HashMap;

use serde::Deserialize;

/// The server's reply to the `ismaster` probe sent after connecting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IsMasterReply {
    #[serde(rename = "ismaster", alias = "isMaster", default)]
    pub(crate) is_master: Option<bool>,

    #[serde(default)]
    pub(crate) secondary: Option<bool>,

    /// The replica set name, absent outside replica-set deployments.
    #[serde(rename = "setName", default)]
    pub(crate) set_name: Option<String>,

    #[serde(default)]
    pub(crate) max_bson_object_size: Option<i32>,

    #[serde(rename = "maxMessageSizeBytes", default)]
    pub(crate) max_message_size_bytes: Option<i32>,

    #[serde(default)]
    pub(crate) max_wire_version: Option<i32>,

    #[serde(default)]
    pub(crate) tags: Option<HashMap<String, String>>,
}

impl IsMasterReply {
    pub(crate) fn is_primary(&self) -> bool {
        self.is_master.unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::IsMasterReply;

    #[test]
    fn deserializes_primary_reply() {
        let reply: IsMasterReply = bson::from_document(doc! {
            "ismaster": true,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48 * 1024 * 1024,
            "maxWireVersion": 2,
            "setName": "rs0",
            "tags": { "dc": "ny" },
            "ok": 1.0,
        })
        .unwrap();

        assert!(reply.is_primary());
        assert_eq!(reply.max_bson_object_size, Some(16 * 1024 * 1024));
        assert_eq!(reply.max_wire_version, Some(2));
        assert_eq!(reply.set_name.as_deref(), Some("rs0"));
        assert_eq!(reply.tags.unwrap().get("dc").map(String::as_str), Some("ny"));
    }

    #[test]
    fn missing_fields_default() {
        let reply: IsMasterReply = bson::from_document(doc! { "ok": 1.0 }).unwrap();
        assert!(!reply.is_primary());
        assert!(reply.secondary.is_none());
        assert!(reply.max_message_size_bytes.is_none());
    }
}
