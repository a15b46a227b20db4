use std::{io::IoSlice, ops::Range};

use bson::RawDocument;

use super::{
    flags::{DeleteFlags, InsertFlags, QueryFlags, ResponseFlags, UpdateFlags},
    header::{Header, OpCode},
};
use crate::error::{Error, ErrorKind, Result};

/// One request or response message: a common header plus an opcode-keyed
/// body.
///
/// Outbound messages borrow the caller's document buffers; inbound messages
/// borrow the receive buffer they were scattered from.
#[derive(Debug)]
pub(crate) struct Rpc<'a> {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) body: RpcBody<'a>,
}

#[derive(Debug)]
pub(crate) enum RpcBody<'a> {
    Reply(Reply<'a>),
    Msg(Msg<'a>),
    Update(Update<'a>),
    Insert(Insert<'a>),
    Query(Query<'a>),
    GetMore(GetMore<'a>),
    Delete(Delete<'a>),
    KillCursors(KillCursors),
}

#[derive(Debug)]
pub(crate) struct Reply<'a> {
    pub(crate) flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) num_returned: i32,
    /// Concatenated documents, split lazily on their length prefixes.
    pub(crate) documents: &'a [u8],
}

#[derive(Debug)]
pub(crate) struct Msg<'a> {
    pub(crate) message: &'a str,
}

#[derive(Debug)]
pub(crate) struct Update<'a> {
    pub(crate) namespace: &'a str,
    pub(crate) flags: UpdateFlags,
    pub(crate) selector: &'a [u8],
    pub(crate) update: &'a [u8],
}

#[derive(Debug)]
pub(crate) struct Insert<'a> {
    pub(crate) flags: InsertFlags,
    pub(crate) namespace: &'a str,
    pub(crate) documents: Vec<&'a [u8]>,
}

#[derive(Debug)]
pub(crate) struct Query<'a> {
    pub(crate) flags: QueryFlags,
    pub(crate) namespace: &'a str,
    pub(crate) skip: i32,
    pub(crate) num_to_return: i32,
    pub(crate) query: &'a [u8],
    pub(crate) fields: Option<&'a [u8]>,
}

#[derive(Debug)]
pub(crate) struct GetMore<'a> {
    pub(crate) namespace: &'a str,
    pub(crate) num_to_return: i32,
    pub(crate) cursor_id: i64,
}

#[derive(Debug)]
pub(crate) struct Delete<'a> {
    pub(crate) namespace: &'a str,
    pub(crate) flags: DeleteFlags,
    pub(crate) selector: &'a [u8],
}

#[derive(Debug)]
pub(crate) struct KillCursors {
    pub(crate) cursor_ids: Vec<i64>,
}

impl<'a> Rpc<'a> {
    pub(crate) fn new(body: RpcBody<'a>) -> Self {
        Self {
            request_id: 0,
            response_to: 0,
            body,
        }
    }

    pub(crate) fn op_code(&self) -> OpCode {
        match self.body {
            RpcBody::Reply(..) => OpCode::Reply,
            RpcBody::Msg(..) => OpCode::Msg,
            RpcBody::Update(..) => OpCode::Update,
            RpcBody::Insert(..) => OpCode::Insert,
            RpcBody::Query(..) => OpCode::Query,
            RpcBody::GetMore(..) => OpCode::GetMore,
            RpcBody::Delete(..) => OpCode::Delete,
            RpcBody::KillCursors(..) => OpCode::KillCursors,
        }
    }

    /// Whether this message mutates data and therefore must be routed to a
    /// primary and may warrant a getLastError follow-up.
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self.body,
            RpcBody::Update(..) | RpcBody::Insert(..) | RpcBody::Delete(..)
        )
    }

    pub(crate) fn namespace(&self) -> Option<&'a str> {
        match self.body {
            RpcBody::Update(ref b) => Some(b.namespace),
            RpcBody::Insert(ref b) => Some(b.namespace),
            RpcBody::Query(ref b) => Some(b.namespace),
            RpcBody::GetMore(ref b) => Some(b.namespace),
            RpcBody::Delete(ref b) => Some(b.namespace),
            _ => None,
        }
    }

    /// Gathers this message into scratch bytes for the header and fixed
    /// fields plus an interleave of borrowed document payloads. Document
    /// buffers are referenced, never copied; all integers are emitted
    /// little-endian.
    pub(crate) fn gather(&self) -> GatheredRpc<'a> {
        let mut g = Gatherer::new();

        // Header; the length is patched once the body is gathered.
        g.put_i32(0);
        g.put_i32(self.request_id);
        g.put_i32(self.response_to);
        g.put_i32(self.op_code() as i32);

        match self.body {
            RpcBody::Reply(ref b) => {
                g.put_i32(b.flags.bits() as i32);
                g.put_i64(b.cursor_id);
                g.put_i32(b.starting_from);
                g.put_i32(b.num_returned);
                if !b.documents.is_empty() {
                    g.put_payload_stream(b.documents);
                }
            }
            RpcBody::Msg(ref b) => {
                g.put_cstring(b.message);
            }
            RpcBody::Update(ref b) => {
                g.put_i32(0);
                g.put_cstring(b.namespace);
                g.put_i32(b.flags.wire_bits() as i32);
                g.put_payload(b.selector);
                g.put_payload(b.update);
            }
            RpcBody::Insert(ref b) => {
                g.put_i32(b.flags.wire_bits() as i32);
                g.put_cstring(b.namespace);
                for document in &b.documents {
                    g.put_payload(document);
                }
            }
            RpcBody::Query(ref b) => {
                g.put_i32(b.flags.bits() as i32);
                g.put_cstring(b.namespace);
                g.put_i32(b.skip);
                g.put_i32(b.num_to_return);
                g.put_payload(b.query);
                if let Some(fields) = b.fields {
                    g.put_payload(fields);
                }
            }
            RpcBody::GetMore(ref b) => {
                g.put_i32(0);
                g.put_cstring(b.namespace);
                g.put_i32(b.num_to_return);
                g.put_i64(b.cursor_id);
            }
            RpcBody::Delete(ref b) => {
                g.put_i32(0);
                g.put_cstring(b.namespace);
                g.put_i32(b.flags.bits() as i32);
                g.put_payload(b.selector);
            }
            RpcBody::KillCursors(ref b) => {
                g.put_i32(0);
                g.put_i32(b.cursor_ids.len() as i32);
                for id in &b.cursor_ids {
                    g.put_i64(*id);
                }
            }
        }

        g.finish()
    }

    /// Partitions a contiguous received message into a view over its variant
    /// fields. Returned slices borrow `buf`.
    pub(crate) fn scatter(buf: &'a [u8]) -> Result<Rpc<'a>> {
        let header = Header::from_slice(buf)?;
        if header.length as usize != buf.len() {
            return Err(ErrorKind::MessageSize {
                message: format!(
                    "message length field says {} bytes but {} were received",
                    header.length,
                    buf.len()
                ),
            }
            .into());
        }

        let mut reader = SliceReader {
            buf: &buf[Header::LENGTH..],
        };

        let body = match header.op_code {
            OpCode::Reply => {
                let flags = ResponseFlags::from_bits_retain(reader.read_i32()? as u32);
                let cursor_id = reader.read_i64()?;
                let starting_from = reader.read_i32()?;
                let num_returned = reader.read_i32()?;
                RpcBody::Reply(Reply {
                    flags,
                    cursor_id,
                    starting_from,
                    num_returned,
                    documents: reader.take_rest(),
                })
            }
            OpCode::Msg => RpcBody::Msg(Msg {
                message: reader.read_cstring()?,
            }),
            OpCode::Update => {
                reader.read_i32()?;
                RpcBody::Update(Update {
                    namespace: reader.read_cstring()?,
                    flags: UpdateFlags::from_bits_retain(reader.read_i32()? as u32),
                    selector: reader.read_document()?,
                    update: reader.read_document()?,
                })
            }
            OpCode::Insert => {
                let flags = InsertFlags::from_bits_retain(reader.read_i32()? as u32);
                let namespace = reader.read_cstring()?;
                let mut documents = Vec::new();
                while !reader.is_empty() {
                    documents.push(reader.read_document()?);
                }
                if documents.is_empty() {
                    return Err(Error::invalid_response("OP_INSERT with no documents"));
                }
                RpcBody::Insert(Insert {
                    flags,
                    namespace,
                    documents,
                })
            }
            OpCode::Query => {
                let flags = QueryFlags::from_bits_retain(reader.read_i32()? as u32);
                let namespace = reader.read_cstring()?;
                let skip = reader.read_i32()?;
                let num_to_return = reader.read_i32()?;
                let query = reader.read_document()?;
                let fields = if reader.is_empty() {
                    None
                } else {
                    Some(reader.read_document()?)
                };
                RpcBody::Query(Query {
                    flags,
                    namespace,
                    skip,
                    num_to_return,
                    query,
                    fields,
                })
            }
            OpCode::GetMore => {
                reader.read_i32()?;
                RpcBody::GetMore(GetMore {
                    namespace: reader.read_cstring()?,
                    num_to_return: reader.read_i32()?,
                    cursor_id: reader.read_i64()?,
                })
            }
            OpCode::Delete => {
                reader.read_i32()?;
                RpcBody::Delete(Delete {
                    namespace: reader.read_cstring()?,
                    flags: DeleteFlags::from_bits_retain(reader.read_i32()? as u32),
                    selector: reader.read_document()?,
                })
            }
            OpCode::KillCursors => {
                reader.read_i32()?;
                let count = reader.read_i32()?;
                if count < 0 {
                    return Err(Error::invalid_response("negative KILL_CURSORS count"));
                }
                let mut cursor_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    cursor_ids.push(reader.read_i64()?);
                }
                RpcBody::KillCursors(KillCursors { cursor_ids })
            }
        };

        if !matches!(body, RpcBody::Reply(..)) && !reader.is_empty() {
            return Err(Error::invalid_response(format!(
                "{} trailing bytes after {:?} body",
                reader.buf.len(),
                header.op_code
            )));
        }

        Ok(Rpc {
            request_id: header.request_id,
            response_to: header.response_to,
            body,
        })
    }
}

/// A gathered wire message: scratch bytes for the header and fixed fields,
/// interleaved with borrowed payload slices.
#[derive(Debug)]
pub(crate) struct GatheredRpc<'a> {
    scratch: Vec<u8>,
    parts: Vec<Part<'a>>,
    message_length: i32,
}

#[derive(Debug)]
enum Part<'a> {
    Scratch(Range<usize>),
    Payload(&'a [u8]),
}

impl GatheredRpc<'_> {
    pub(crate) fn message_length(&self) -> i32 {
        self.message_length
    }

    /// Appends this message's I/O vectors to `iovs` for a single gathering
    /// write.
    pub(crate) fn extend_io_slices<'g>(&'g self, iovs: &mut Vec<IoSlice<'g>>) {
        for part in &self.parts {
            match part {
                Part::Scratch(range) => iovs.push(IoSlice::new(&self.scratch[range.clone()])),
                Part::Payload(bytes) => iovs.push(IoSlice::new(bytes)),
            }
        }
    }

    /// Concatenates the vectors into one owned buffer. The async scanner
    /// keeps its (small) probe commands serialized this way so the bytes
    /// outlive the gathered borrows.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.message_length as usize);
        for part in &self.parts {
            match part {
                Part::Scratch(range) => bytes.extend_from_slice(&self.scratch[range.clone()]),
                Part::Payload(payload) => bytes.extend_from_slice(payload),
            }
        }
        bytes
    }
}

struct Gatherer<'a> {
    scratch: Vec<u8>,
    parts: Vec<Part<'a>>,
    run_start: usize,
}

impl<'a> Gatherer<'a> {
    fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(64),
            parts: Vec::new(),
            run_start: 0,
        }
    }

    fn put_i32(&mut self, value: i32) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn put_cstring(&mut self, value: &str) {
        debug_assert!(!value.as_bytes().contains(&0));
        self.scratch.extend_from_slice(value.as_bytes());
        self.scratch.push(0);
    }

    fn put_payload(&mut self, payload: &'a [u8]) {
        debug_assert_eq!(document_length(payload), Some(payload.len()));
        self.put_payload_stream(payload);
    }

    fn put_payload_stream(&mut self, payload: &'a [u8]) {
        self.end_run();
        self.parts.push(Part::Payload(payload));
    }

    fn end_run(&mut self) {
        if self.run_start < self.scratch.len() {
            self.parts.push(Part::Scratch(self.run_start..self.scratch.len()));
        }
        self.run_start = self.scratch.len();
    }

    fn finish(mut self) -> GatheredRpc<'a> {
        self.end_run();

        let total: usize = self
            .parts
            .iter()
            .map(|part| match part {
                Part::Scratch(range) => range.len(),
                Part::Payload(payload) => payload.len(),
            })
            .sum();
        let message_length = total as i32;
        self.scratch[0..4].copy_from_slice(&message_length.to_le_bytes());

        GatheredRpc {
            scratch: self.scratch,
            parts: self.parts,
            message_length,
        }
    }
}

/// Reply contents owned by a cursor, detached from the receive buffer so
/// iteration can outlive the next network exchange.
#[derive(Debug)]
pub(crate) struct OwnedReply {
    pub(crate) response_to: i32,
    pub(crate) flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    #[allow(dead_code)]
    pub(crate) starting_from: i32,
    pub(crate) num_returned: i32,
    pub(crate) documents: Vec<u8>,
}

impl OwnedReply {
    pub(crate) fn from_rpc(rpc: &Rpc<'_>) -> Result<Self> {
        match rpc.body {
            RpcBody::Reply(ref reply) => Ok(Self {
                response_to: rpc.response_to,
                flags: reply.flags,
                cursor_id: reply.cursor_id,
                starting_from: reply.starting_from,
                num_returned: reply.num_returned,
                documents: reply.documents.to_vec(),
            }),
            _ => Err(Error::invalid_response(format!(
                "expected OP_REPLY but received {:?}",
                rpc.op_code()
            ))),
        }
    }

    /// The first document of the reply, if any.
    pub(crate) fn first_document(&self) -> Result<Option<&RawDocument>> {
        Ok(split_first_document(&self.documents)?.map(|(doc, _)| doc))
    }

    /// Surfaces the server-set failure flags: QUERY_FAILURE carries an error
    /// document with `$err` and `code`, CURSOR_NOT_FOUND means the
    /// server-side cursor is gone.
    pub(crate) fn check_failure_flags(&self) -> Result<()> {
        if self.flags.contains(ResponseFlags::QUERY_FAILURE) {
            let mut code = 0;
            let mut message = "unknown query failure".to_string();
            if let Some(doc) = self.first_document()? {
                if let Ok(err) = doc.get_str("$err") {
                    message = err.to_string();
                }
                if let Ok(c) = doc.get_i32("code") {
                    code = c;
                }
            }
            return Err(Error::new(crate::error::ErrorKind::Query(
                crate::error::CommandError { code, message },
            )));
        }

        if self.flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
            return Err(Error::new(crate::error::ErrorKind::CursorNotFound {
                message: "the cursor is invalid or has expired".to_string(),
            }));
        }

        Ok(())
    }
}

/// Splits the leading document off a concatenated document stream using its
/// embedded length prefix.
pub(crate) fn split_first_document(bytes: &[u8]) -> Result<Option<(&RawDocument, &[u8])>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let len = document_length(bytes).ok_or_else(|| {
        Error::invalid_response("truncated document in reply document stream")
    })?;
    let (head, rest) = bytes.split_at(len);
    let doc = RawDocument::from_bytes(head)?;
    Ok(Some((doc, rest)))
}

fn document_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 5 {
        return None;
    }
    let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len < 5 || len as usize > bytes.len() {
        return None;
    }
    Some(len as usize)
}

struct SliceReader<'a> {
    buf: &'a [u8],
}

impl<'a> SliceReader<'a> {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn read_i32(&mut self) -> Result<i32> {
        if self.buf.len() < 4 {
            return Err(truncated("i32"));
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(i32::from_le_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        if self.buf.len() < 8 {
            return Err(truncated("i64"));
        }
        let (head, rest) = self.buf.split_at(8);
        self.buf = rest;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(head);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_cstring(&mut self) -> Result<&'a str> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| truncated("cstring"))?;
        let (head, rest) = self.buf.split_at(nul + 1);
        self.buf = rest;
        std::str::from_utf8(&head[..nul])
            .map_err(|_| Error::invalid_response("cstring is not valid UTF-8"))
    }

    fn read_document(&mut self) -> Result<&'a [u8]> {
        let len = document_length(self.buf).ok_or_else(|| truncated("document"))?;
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

fn truncated(what: &str) -> Error {
    Error::invalid_response(format!("message body truncated while reading {}", what))
}
