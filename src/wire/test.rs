use bson::doc;
use pretty_assertions::assert_eq;

use super::{
    split_first_document,
    Delete,
    DeleteFlags,
    GetMore,
    Insert,
    InsertFlags,
    KillCursors,
    Msg,
    OpCode,
    Query,
    QueryFlags,
    Reply,
    ResponseFlags,
    Rpc,
    RpcBody,
    Update,
    UpdateFlags,
};

fn doc_bytes(doc: bson::Document) -> Vec<u8> {
    bson::to_vec(&doc).unwrap()
}

fn encode(rpc: &Rpc<'_>) -> Vec<u8> {
    let gathered = rpc.gather();

    let mut iovs = Vec::new();
    gathered.extend_io_slices(&mut iovs);
    let iov_total: usize = iovs.iter().map(|iov| iov.len()).sum();
    assert_eq!(iov_total as i32, gathered.message_length());

    let bytes = gathered.to_bytes();
    assert_eq!(bytes.len(), iov_total);
    bytes
}

fn assert_round_trips(bytes: &[u8]) {
    let rpc = Rpc::scatter(bytes).unwrap();
    assert_eq!(encode(&rpc), bytes);
}

#[test]
fn header_fields_are_little_endian() {
    let query = doc_bytes(doc! {});
    let mut rpc = Rpc::new(RpcBody::Query(Query {
        flags: QueryFlags::empty(),
        namespace: "db.c",
        skip: 0,
        num_to_return: 0,
        query: &query,
        fields: None,
    }));
    rpc.request_id = 0x01020304;

    let bytes = encode(&rpc);
    assert_eq!(&bytes[0..4], &(bytes.len() as i32).to_le_bytes());
    assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(&bytes[12..16], &2004i32.to_le_bytes());
}

#[test]
fn query_round_trip() {
    let query = doc_bytes(doc! { "x": { "$gt": 1 } });
    let fields = doc_bytes(doc! { "x": 1 });

    let mut rpc = Rpc::new(RpcBody::Query(Query {
        flags: QueryFlags::SLAVE_OK | QueryFlags::NO_CURSOR_TIMEOUT,
        namespace: "db.coll",
        skip: 5,
        num_to_return: -1,
        query: &query,
        fields: Some(&fields),
    }));
    rpc.request_id = 42;

    let bytes = encode(&rpc);
    let parsed = Rpc::scatter(&bytes).unwrap();
    assert_eq!(parsed.request_id, 42);
    assert_eq!(parsed.op_code(), OpCode::Query);
    match parsed.body {
        RpcBody::Query(ref q) => {
            assert_eq!(q.namespace, "db.coll");
            assert_eq!(q.skip, 5);
            assert_eq!(q.num_to_return, -1);
            assert!(q.flags.contains(QueryFlags::SLAVE_OK));
            assert_eq!(q.query, &query[..]);
            assert_eq!(q.fields, Some(&fields[..]));
        }
        ref other => panic!("scattered into {:?}", other),
    }
    assert_round_trips(&bytes);
}

#[test]
fn every_opcode_round_trips() {
    let selector = doc_bytes(doc! { "_id": 1 });
    let update = doc_bytes(doc! { "$set": { "a": 2 } });
    let doc_a = doc_bytes(doc! { "_id": 1, "a": 1 });
    let doc_b = doc_bytes(doc! { "_id": 2 });
    let reply_docs: Vec<u8> = [&doc_a[..], &doc_b[..]].concat();

    let messages = vec![
        Rpc::new(RpcBody::Reply(Reply {
            flags: ResponseFlags::AWAIT_CAPABLE,
            cursor_id: 77,
            starting_from: 0,
            num_returned: 2,
            documents: &reply_docs,
        })),
        Rpc::new(RpcBody::Msg(Msg { message: "hi" })),
        Rpc::new(RpcBody::Update(Update {
            namespace: "db.c",
            flags: UpdateFlags::UPSERT,
            selector: &selector,
            update: &update,
        })),
        Rpc::new(RpcBody::Insert(Insert {
            flags: InsertFlags::CONTINUE_ON_ERROR,
            namespace: "db.c",
            documents: vec![&doc_a, &doc_b],
        })),
        Rpc::new(RpcBody::Query(Query {
            flags: QueryFlags::empty(),
            namespace: "db.c",
            skip: 0,
            num_to_return: 10,
            query: &selector,
            fields: None,
        })),
        Rpc::new(RpcBody::GetMore(GetMore {
            namespace: "db.c",
            num_to_return: 2,
            cursor_id: 424242,
        })),
        Rpc::new(RpcBody::Delete(Delete {
            namespace: "db.c",
            flags: DeleteFlags::SINGLE_REMOVE,
            selector: &selector,
        })),
        Rpc::new(RpcBody::KillCursors(KillCursors {
            cursor_ids: vec![1, -9, i64::MAX],
        })),
    ];

    for rpc in &messages {
        assert_round_trips(&encode(rpc));
    }
}

#[test]
fn scatter_rejects_short_messages() {
    Rpc::scatter(&[0u8; 8]).unwrap_err();

    // A header whose length disagrees with the received byte count.
    let mut bytes = encode(&Rpc::new(RpcBody::Msg(Msg { message: "x" })));
    bytes[0..4].copy_from_slice(&100i32.to_le_bytes());
    Rpc::scatter(&bytes).unwrap_err();
}

#[test]
fn scatter_rejects_unknown_opcode() {
    let mut bytes = encode(&Rpc::new(RpcBody::Msg(Msg { message: "x" })));
    bytes[12..16].copy_from_slice(&9999i32.to_le_bytes());
    Rpc::scatter(&bytes).unwrap_err();
}

#[test]
fn scatter_rejects_truncated_document() {
    let selector = doc_bytes(doc! { "_id": 1 });
    let bytes = encode(&Rpc::new(RpcBody::Delete(Delete {
        namespace: "db.c",
        flags: DeleteFlags::empty(),
        selector: &selector,
    })));

    // Drop the final byte of the selector document.
    let mut truncated = bytes.clone();
    truncated.pop();
    let new_len = truncated.len() as i32;
    truncated[0..4].copy_from_slice(&new_len.to_le_bytes());
    Rpc::scatter(&truncated).unwrap_err();
}

#[test]
fn reply_failure_flags_survive_scatter() {
    let err_doc = doc_bytes(doc! { "$err": "exhausted", "code": 43 });
    let bytes = encode(&Rpc::new(RpcBody::Reply(Reply {
        flags: ResponseFlags::QUERY_FAILURE,
        cursor_id: 0,
        starting_from: 0,
        num_returned: 1,
        documents: &err_doc,
    })));

    match Rpc::scatter(&bytes).unwrap().body {
        RpcBody::Reply(ref reply) => {
            assert!(reply.flags.contains(ResponseFlags::QUERY_FAILURE));
            assert_eq!(reply.documents, &err_doc[..]);
        }
        ref other => panic!("scattered into {:?}", other),
    }
}

#[test]
fn validation_flags_never_hit_the_wire() {
    let doc = doc_bytes(doc! { "a": 1 });
    let bytes = encode(&Rpc::new(RpcBody::Insert(Insert {
        flags: InsertFlags::CONTINUE_ON_ERROR | InsertFlags::NO_VALIDATE,
        namespace: "db.c",
        documents: vec![&doc],
    })));

    // Flags are the first body field after the 16-byte header.
    let wire_flags = i32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    assert_eq!(wire_flags, InsertFlags::CONTINUE_ON_ERROR.bits() as i32);
}

#[test]
fn document_stream_splits_on_length_prefixes() {
    let doc_a = doc_bytes(doc! { "_id": 1 });
    let doc_b = doc_bytes(doc! { "_id": 2, "name": "b" });
    let doc_c = doc_bytes(doc! { "_id": 3 });
    let stream: Vec<u8> = [&doc_a[..], &doc_b[..], &doc_c[..]].concat();

    let mut rest = &stream[..];
    let mut seen = Vec::new();
    while let Some((doc, tail)) = split_first_document(rest).unwrap() {
        seen.push(doc.get_i32("_id").unwrap());
        rest = tail;
    }
    assert_eq!(seen, vec![1, 2, 3]);

    // A corrupt tail is an error, not an end-of-stream.
    let mut corrupt = stream.clone();
    corrupt.truncate(stream.len() - 2);
    let (_, tail) = split_first_document(&corrupt).unwrap().unwrap();
    let (_, tail) = split_first_document(tail).unwrap().unwrap();
    split_first_document(tail).unwrap_err();
}
