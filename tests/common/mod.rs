//! An in-process server speaking just enough of the legacy wire protocol to
//! script conversations with the driver. Messages are parsed and replies are
//! encoded by hand here, independently of the driver's own codec.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::Document;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;

/// A message the mock server received, decoded.
#[derive(Clone, Debug)]
pub enum Received {
    Query {
        ns: String,
        flags: u32,
        skip: i32,
        n_return: i32,
        query: Document,
    },
    Insert {
        ns: String,
        flags: u32,
        documents: Vec<Document>,
    },
    Update {
        ns: String,
        flags: u32,
        selector: Document,
        update: Document,
    },
    Delete {
        ns: String,
        flags: u32,
        selector: Document,
    },
    GetMore {
        ns: String,
        n_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Received {
    pub fn query_document(&self) -> Option<&Document> {
        match self {
            Received::Query { query, .. } => Some(query),
            _ => None,
        }
    }
}

/// What the script wants done with a received message.
pub enum Action {
    /// Send these raw bytes back.
    Reply(Vec<u8>),
    /// Send nothing (fire-and-forget messages).
    Ignore,
    /// Drop the connection.
    Close,
}

type Script = dyn FnMut(&Received, i32) -> Action + Send;

pub struct MockServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockServer {
    /// Starts a server whose `script` is invoked with every decoded message
    /// and its request id.
    pub async fn start<F>(script: F) -> MockServer
    where
        F: FnMut(&Received, i32) -> Action + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let script: Arc<Mutex<Box<Script>>> = Arc::new(Mutex::new(Box::new(script)));
        let log = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let script = Arc::clone(&script);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, script, log).await;
                });
            }
        });

        MockServer { addr, received }
    }

    pub fn uri(&self) -> String {
        format!("mongodb://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Waits until `predicate` matches one of the received messages.
    pub async fn wait_for<P>(&self, mut predicate: P)
    where
        P: FnMut(&Received) -> bool,
    {
        for _ in 0..100 {
            if self.received().iter().any(&mut predicate) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("mock server never received the expected message");
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    script: Arc<Mutex<Box<Script>>>,
    log: Arc<Mutex<Vec<Received>>>,
) -> std::io::Result<()> {
    loop {
        let mut prefix = [0u8; 4];
        if stream.read_exact(&mut prefix).await.is_err() {
            return Ok(());
        }
        let len = i32::from_le_bytes(prefix) as usize;
        let mut message = vec![0u8; len];
        message[..4].copy_from_slice(&prefix);
        stream.read_exact(&mut message[4..]).await?;

        let request_id = read_i32(&message, 4);
        let opcode = read_i32(&message, 12);
        let received = parse_body(opcode, &message[16..]);
        log.lock().unwrap().push(received.clone());

        let action = {
            let mut script = script.lock().unwrap();
            (*script)(&received, request_id)
        };
        match action {
            Action::Reply(bytes) => stream.write_all(&bytes).await?,
            Action::Ignore => {}
            Action::Close => return Ok(()),
        }
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn read_cstring(bytes: &[u8], at: usize) -> (String, usize) {
    let nul = bytes[at..].iter().position(|&b| b == 0).unwrap();
    (
        String::from_utf8(bytes[at..at + nul].to_vec()).unwrap(),
        at + nul + 1,
    )
}

fn read_document(bytes: &[u8], at: usize) -> (Document, usize) {
    let len = read_i32(bytes, at) as usize;
    let doc = bson::from_slice(&bytes[at..at + len]).unwrap();
    (doc, at + len)
}

fn parse_body(opcode: i32, body: &[u8]) -> Received {
    match opcode {
        OP_QUERY => {
            let flags = read_i32(body, 0) as u32;
            let (ns, at) = read_cstring(body, 4);
            let skip = read_i32(body, at);
            let n_return = read_i32(body, at + 4);
            let (query, _) = read_document(body, at + 8);
            Received::Query {
                ns,
                flags,
                skip,
                n_return,
                query,
            }
        }
        OP_INSERT => {
            let flags = read_i32(body, 0) as u32;
            let (ns, mut at) = read_cstring(body, 4);
            let mut documents = Vec::new();
            while at < body.len() {
                let (doc, next) = read_document(body, at);
                documents.push(doc);
                at = next;
            }
            Received::Insert {
                ns,
                flags,
                documents,
            }
        }
        OP_UPDATE => {
            let (ns, at) = read_cstring(body, 4);
            let flags = read_i32(body, at) as u32;
            let (selector, at) = read_document(body, at + 4);
            let (update, _) = read_document(body, at);
            Received::Update {
                ns,
                flags,
                selector,
                update,
            }
        }
        OP_DELETE => {
            let (ns, at) = read_cstring(body, 4);
            let flags = read_i32(body, at) as u32;
            let (selector, _) = read_document(body, at + 4);
            Received::Delete {
                ns,
                flags,
                selector,
            }
        }
        OP_GET_MORE => {
            let (ns, at) = read_cstring(body, 4);
            let n_return = read_i32(body, at);
            let cursor_id = read_i64(body, at + 4);
            Received::GetMore {
                ns,
                n_return,
                cursor_id,
            }
        }
        OP_KILL_CURSORS => {
            let count = read_i32(body, 4);
            let mut cursor_ids = Vec::new();
            for i in 0..count {
                cursor_ids.push(read_i64(body, 8 + (i as usize) * 8));
            }
            Received::KillCursors { cursor_ids }
        }
        other => panic!("mock server received unsupported opcode {}", other),
    }
}

/// Encodes an OP_REPLY carrying `documents`.
pub fn reply(response_to: i32, flags: u32, cursor_id: i64, documents: &[Document]) -> Vec<u8> {
    let mut docs_bytes = Vec::new();
    for doc in documents {
        docs_bytes.extend(bson::to_vec(doc).unwrap());
    }

    let len = 16 + 20 + docs_bytes.len();
    let mut bytes = Vec::with_capacity(len);
    bytes.extend((len as i32).to_le_bytes());
    bytes.extend(1i32.to_le_bytes()); // server-side request id
    bytes.extend(response_to.to_le_bytes());
    bytes.extend(OP_REPLY.to_le_bytes());
    bytes.extend((flags as i32).to_le_bytes());
    bytes.extend(cursor_id.to_le_bytes());
    bytes.extend(0i32.to_le_bytes()); // starting_from
    bytes.extend((documents.len() as i32).to_le_bytes());
    bytes.extend(docs_bytes);
    bytes
}

/// The standing reply to the connection handshake.
pub fn ismaster_reply(response_to: i32) -> Vec<u8> {
    reply(
        response_to,
        0,
        0,
        &[bson::doc! {
            "ismaster": true,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48 * 1024 * 1024,
            "maxWireVersion": 2,
            "ok": 1.0,
        }],
    )
}

/// Whether a query is the `ismaster` handshake probe.
pub fn is_handshake(received: &Received) -> bool {
    matches!(
        received.query_document(),
        Some(doc) if doc.contains_key("ismaster")
    )
}

/// Whether a query is a getLastError acknowledgement fetch.
pub fn is_get_last_error(received: &Received) -> bool {
    matches!(
        received.query_document(),
        Some(doc) if doc.contains_key("getLastError")
    )
}
