use bitflags::bitflags;

bitflags! {
    /// Flags for an OP_QUERY message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Leave the cursor open after the last batch instead of closing it.
        const TAILABLE_CURSOR   = 0b0000_0010;
        /// Allow the query to run against a secondary.
        const SLAVE_OK          = 0b0000_0100;
        /// Internal replication flag; drivers set it only when tailing the
        /// oplog.
        const OPLOG_REPLAY      = 0b0000_1000;
        /// Prevent the server from timing the cursor out after inactivity.
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        /// Block briefly at the end of a tailable cursor instead of
        /// returning an empty batch.
        const AWAIT_DATA        = 0b0010_0000;
        /// Stream the results in multiple reply messages without further
        /// GET_MOREs.
        const EXHAUST           = 0b0100_0000;
        /// Return partial results if some shards are unavailable.
        const PARTIAL           = 0b1000_0000;
    }
}

bitflags! {
    /// Flags set by the server on an OP_REPLY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResponseFlags: u32 {
        /// The GET_MORE named a cursor id the server no longer knows.
        const CURSOR_NOT_FOUND   = 0b0001;
        /// The query failed; the reply carries a single `$err` document.
        const QUERY_FAILURE      = 0b0010;
        /// Internal sharding flag.
        const SHARD_CONFIG_STALE = 0b0100;
        /// The server supports the AWAIT_DATA query flag.
        const AWAIT_CAPABLE      = 0b1000;
    }
}

bitflags! {
    /// Flags for an OP_INSERT message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Keep inserting the remaining documents after one fails.
        const CONTINUE_ON_ERROR = 0b0001;
        /// Skip client-side document key validation. Never sent to the
        /// server.
        const NO_VALIDATE       = 1 << 31;
    }
}

bitflags! {
    /// Flags for an OP_UPDATE message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UpdateFlags: u32 {
        /// Insert the document if no document matches the selector.
        const UPSERT       = 0b0001;
        /// Update every matching document instead of the first.
        const MULTI_UPDATE = 0b0010;
        /// Skip client-side document key validation. Never sent to the
        /// server.
        const NO_VALIDATE  = 1 << 31;
    }
}

bitflags! {
    /// Flags for an OP_DELETE message.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeleteFlags: u32 {
        /// Delete only the first matching document.
        const SINGLE_REMOVE = 0b0001;
    }
}

impl InsertFlags {
    /// The bits that actually go on the wire.
    pub(crate) fn wire_bits(self) -> u32 {
        (self & !InsertFlags::NO_VALIDATE).bits()
    }
}

impl UpdateFlags {
    /// The bits that actually go on the wire.
    pub(crate) fn wire_bits(self) -> u32 {
        (self & !UpdateFlags::NO_VALIDATE).bits()
    }
}
