use std::time::Duration;

use bson::doc;
use tokio::net::TcpListener;

use super::Cluster;
use crate::{
    client::options::{ClientOptions, ServerAddress},
    runtime::{AsyncStream, BaseStream},
    selection_criteria::ReadPreference,
    wire::{Insert, InsertFlags, Query, QueryFlags, Rpc, RpcBody},
};

async fn connected_stream() -> AsyncStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stream, _accepted) =
        tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
    AsyncStream::Plain(BaseStream::Tcp(stream.unwrap()))
}

fn hosts(n: usize) -> Vec<ServerAddress> {
    (0..n)
        .map(|i| ServerAddress::Tcp {
            host: format!("node{}", i),
            port: Some(27017),
        })
        .collect()
}

async fn replica_set_cluster(n: usize) -> Cluster {
    let options = ClientOptions::builder()
        .hosts(hosts(n))
        .repl_set_name("rs0".to_string())
        .build();
    let mut cluster = Cluster::new(options).unwrap();
    for index in 0..n {
        let stream = connected_stream().await;
        cluster.nodes[index].attach_stream(stream);
    }
    cluster
}

fn slave_ok_query(query: &[u8]) -> Rpc<'_> {
    Rpc::new(RpcBody::Query(Query {
        flags: QueryFlags::SLAVE_OK,
        namespace: "db.c",
        skip: 0,
        num_to_return: 0,
        query,
        fields: None,
    }))
}

#[tokio::test]
async fn direct_mode_always_uses_the_sole_node() {
    let options = ClientOptions::builder().hosts(hosts(1)).build();
    let mut cluster = Cluster::new(options).unwrap();
    let query = bson::to_vec(&doc! {}).unwrap();

    let batch = [slave_ok_query(&query)];
    assert_eq!(cluster.select(&batch, 0, None), None);

    let stream = connected_stream().await;
    cluster.nodes[0].attach_stream(stream);
    assert_eq!(cluster.select(&batch, 0, None), Some(0));
}

#[tokio::test]
async fn writes_and_unflagged_queries_pin_to_the_primary() {
    let mut cluster = replica_set_cluster(3).await;
    cluster.nodes[1].primary = true;

    let doc_bytes = bson::to_vec(&doc! { "_id": 1 }).unwrap();
    let insert = [Rpc::new(RpcBody::Insert(Insert {
        flags: InsertFlags::empty(),
        namespace: "db.c",
        documents: vec![&doc_bytes],
    }))];

    for _ in 0..100 {
        assert_eq!(cluster.select(&insert, 0, None), Some(1));
    }

    let query = bson::to_vec(&doc! {}).unwrap();
    let plain_query = [Rpc::new(RpcBody::Query(Query {
        flags: QueryFlags::empty(),
        namespace: "db.c",
        skip: 0,
        num_to_return: 0,
        query: &query,
        fields: None,
    }))];
    for _ in 0..100 {
        assert_eq!(cluster.select(&plain_query, 0, None), Some(1));
    }

    // No primary: writes cannot be routed at all.
    cluster.nodes[1].primary = false;
    assert_eq!(cluster.select(&insert, 0, None), None);
}

#[tokio::test]
async fn hint_routes_follow_ups_to_the_same_node() {
    let mut cluster = replica_set_cluster(3).await;
    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];

    assert_eq!(cluster.select(&batch, 3, None), Some(2));

    // A dead hinted node fails the selection rather than silently moving
    // the cursor to another node.
    cluster.disconnect_node(2).await;
    assert_eq!(cluster.select(&batch, 3, None), None);
}

#[tokio::test]
async fn latency_filter_and_fairness() {
    let mut cluster = replica_set_cluster(4).await;
    cluster.nodes[0].primary = true;
    cluster.nodes[0].ping = Some(Duration::from_millis(30));
    cluster.nodes[1].ping = Some(Duration::from_millis(10));
    cluster.nodes[2].ping = Some(Duration::from_millis(12));
    cluster.nodes[3].ping = Some(Duration::from_millis(40));
    cluster.sec_latency = Duration::from_millis(15);

    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];
    let read_prefs = ReadPreference::Secondary { tag_sets: None };

    let mut counts = [0usize; 4];
    for _ in 0..1000 {
        let selected = cluster.select(&batch, 0, Some(&read_prefs)).unwrap();
        counts[selected] += 1;
    }

    // The primary is excluded by the preference, the 40ms secondary by the
    // 10ms + 15ms watermark; the two survivors split evenly within 10%.
    assert_eq!(counts[0], 0);
    assert_eq!(counts[3], 0);
    assert_eq!(counts[1] + counts[2], 1000);
    assert!((450..=550).contains(&counts[1]), "counts: {:?}", counts);
    assert!((450..=550).contains(&counts[2]), "counts: {:?}", counts);
}

#[tokio::test]
async fn unmeasured_nodes_disable_the_latency_filter() {
    let mut cluster = replica_set_cluster(3).await;
    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];

    let mut seen = [false; 3];
    for _ in 0..200 {
        seen[cluster.select(&batch, 0, None).unwrap()] = true;
    }
    assert_eq!(seen, [true, true, true]);
}

#[tokio::test]
async fn tag_sets_constrain_candidates() {
    let mut cluster = replica_set_cluster(3).await;
    cluster.nodes[0].primary = true;
    cluster.nodes[1]
        .tags
        .insert("dc".to_string(), "ny".to_string());
    cluster.nodes[2]
        .tags
        .insert("dc".to_string(), "sf".to_string());

    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];
    let read_prefs = ReadPreference::Secondary { tag_sets: None }
        .with_tags(vec![[("dc".to_string(), "ny".to_string())]
            .into_iter()
            .collect()])
        .unwrap();

    for _ in 0..100 {
        assert_eq!(cluster.select(&batch, 0, Some(&read_prefs)), Some(1));
    }
}

#[tokio::test]
async fn secondary_preferred_uses_the_primary_only_as_a_last_resort() {
    let mut cluster = replica_set_cluster(3).await;
    cluster.nodes[0].primary = true;

    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];
    let read_prefs = ReadPreference::SecondaryPreferred { tag_sets: None };

    for _ in 0..200 {
        let selected = cluster.select(&batch, 0, Some(&read_prefs)).unwrap();
        assert_ne!(selected, 0, "routed to the primary with secondaries up");
    }

    // With every secondary gone, the primary serves the read.
    cluster.disconnect_node(1).await;
    cluster.disconnect_node(2).await;
    assert_eq!(cluster.select(&batch, 0, Some(&read_prefs)), Some(0));
}

#[tokio::test]
async fn primary_preferred_falls_back_to_secondaries() {
    let mut cluster = replica_set_cluster(3).await;
    cluster.nodes[0].primary = true;

    let query = bson::to_vec(&doc! {}).unwrap();
    let batch = [slave_ok_query(&query)];
    let read_prefs = ReadPreference::PrimaryPreferred { tag_sets: None };

    for _ in 0..200 {
        assert_eq!(cluster.select(&batch, 0, Some(&read_prefs)), Some(0));
    }

    cluster.disconnect_node(0).await;
    for _ in 0..200 {
        let selected = cluster.select(&batch, 0, Some(&read_prefs)).unwrap();
        assert_ne!(selected, 0);
    }
}

#[tokio::test]
async fn selection_failure_surfaces_after_retries() {
    // Nothing listens on this address, so reconnects fail immediately.
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(9),
        }])
        .connect_timeout(Duration::from_millis(200))
        .build();
    let mut cluster = Cluster::new(options).unwrap();

    let query = bson::to_vec(&doc! {}).unwrap();
    let mut batch = [slave_ok_query(&query)];
    cluster
        .operate(&mut batch, 0, None, None)
        .await
        .unwrap_err();
}

#[test]
fn mode_classification_follows_the_uri() {
    use super::ClusterMode;

    let direct = Cluster::new(ClientOptions::builder().hosts(hosts(1)).build()).unwrap();
    assert_eq!(direct.mode, ClusterMode::Direct);

    let sharded = Cluster::new(ClientOptions::builder().hosts(hosts(3)).build()).unwrap();
    assert_eq!(sharded.mode, ClusterMode::Sharded);

    let replica = Cluster::new(
        ClientOptions::builder()
            .hosts(hosts(1))
            .repl_set_name("rs0".to_string())
            .build(),
    )
    .unwrap();
    assert_eq!(replica.mode, ClusterMode::ReplicaSet);

    Cluster::new(ClientOptions::builder().hosts(hosts(13)).build()).unwrap_err();
    Cluster::new(ClientOptions::builder().hosts(vec![]).build()).unwrap_err();
}
