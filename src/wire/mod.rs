//! Gather/scatter codec for the legacy wire protocol.

mod flags;
mod header;
mod message;
#[cfg(test)]
mod test;

pub use self::{
    flags::{DeleteFlags, InsertFlags, QueryFlags, UpdateFlags},
};
pub(crate) use self::{
    flags::ResponseFlags,
    header::{Header, OpCode},
    message::{
        split_first_document,
        Delete,
        GatheredRpc,
        GetMore,
        Insert,
        KillCursors,
        Msg,
        OwnedReply,
        Query,
        Reply,
        Rpc,
        RpcBody,
        Update,
    },
};

/// Messages larger than this are refused outright, inbound or outbound.
pub(crate) const MAX_MESSAGE_SIZE: i32 = 48 * 1024 * 1024;

/// Default cap on a single document, updated per-deployment by the ismaster
/// handshake.
pub(crate) const DEFAULT_MAX_BSON_SIZE: i32 = 16 * 1024 * 1024;
