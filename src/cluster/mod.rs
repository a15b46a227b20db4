//! Node selection, connection establishment, and request routing.

mod auth;
mod is_master;
mod node;
#[cfg(test)]
mod test;

use std::time::{Duration, Instant};

use bson::{doc, Document};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::{
    client::options::ClientOptions,
    concern::WriteConcern,
    error::{Error, ErrorKind, Result},
    runtime::{AsyncStream, TlsConfig},
    scanner::Scanner,
    selection_criteria::ReadPreference,
    wire::{GatheredRpc, KillCursors, OwnedReply, Query, QueryFlags, Rpc, RpcBody},
};

use self::is_master::IsMasterReply;
pub(crate) use self::node::Node;

pub(crate) const MAX_NODES: usize = 12;
const MAX_RETRY_COUNT: usize = 3;
const DEFAULT_SEC_LATENCY: Duration = Duration::from_millis(15);
const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

/// How the deployment was classified at construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ClusterMode {
    /// A single server addressed directly.
    Direct,
    /// A replica set, named by the `replicaSet` URI option.
    ReplicaSet,
    /// Multiple routers in front of a sharded cluster.
    Sharded,
}

/// The result of a routed request: the 1-based hint of the node that served
/// it, plus the reply when one was read.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) hint: u32,
    pub(crate) reply: Option<OwnedReply>,
}

struct SendReport {
    hint: u32,
    gle_request_id: Option<i32>,
}

#[derive(Debug)]
pub(crate) struct Cluster {
    mode: ClusterMode,
    options: ClientOptions,
    tls_config: Option<TlsConfig>,
    nodes: Vec<Node>,
    request_id: i32,
    sec_latency: Duration,
    socket_timeout: Duration,
    max_msg_size: i32,
    max_bson_size: i32,
    wire_version: i32,
    requires_auth: bool,
    rng: SmallRng,
}

impl Cluster {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        if options.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host is required"));
        }
        if options.hosts.len() > MAX_NODES {
            return Err(Error::invalid_argument(format!(
                "at most {} hosts are supported, got {}",
                MAX_NODES,
                options.hosts.len()
            )));
        }

        let mode = if options.repl_set_name.is_some() {
            debug!("client initialized in replica set mode");
            ClusterMode::ReplicaSet
        } else if options.hosts.len() > 1 {
            debug!("client initialized in sharded cluster mode");
            ClusterMode::Sharded
        } else {
            debug!("client initialized in direct mode");
            ClusterMode::Direct
        };

        let tls_config = match options.tls_options {
            Some(ref tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        let requires_auth = options.credential.is_some();
        let nodes = options
            .hosts
            .iter()
            .cloned()
            .map(|address| Node::new(address, requires_auth))
            .collect();

        // Randomize the seed so request ids never collide with a previous
        // client's traffic on a reused connection.
        let mut rng = SmallRng::from_os_rng();
        let request_id = rng.random_range(1..i32::MAX / 2);

        Ok(Self {
            mode,
            sec_latency: options
                .secondary_acceptable_latency
                .unwrap_or(DEFAULT_SEC_LATENCY),
            socket_timeout: options.socket_timeout.unwrap_or(DEFAULT_SOCKET_TIMEOUT),
            tls_config,
            nodes,
            request_id,
            max_msg_size: crate::wire::MAX_MESSAGE_SIZE,
            max_bson_size: crate::wire::DEFAULT_MAX_BSON_SIZE,
            wire_version: 0,
            requires_auth,
            rng,
            options,
        })
    }

    pub(crate) fn wire_version(&self) -> i32 {
        self.wire_version
    }

    pub(crate) fn max_bson_size(&self) -> i32 {
        self.max_bson_size
    }

    /// The stamp of the node a hint refers to; zero for unknown hints.
    pub(crate) fn stamp(&self, hint: u32) -> u32 {
        match (hint as usize).checked_sub(1).and_then(|i| self.nodes.get(i)) {
            Some(node) => node.stamp,
            None => 0,
        }
    }

    fn next_request_id(&mut self) -> i32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn is_connected(&self) -> bool {
        self.nodes.iter().any(Node::has_stream)
    }

    /// Brings the cluster up if no node is usable yet. Called lazily before
    /// the first operation.
    pub(crate) async fn ensure_connected(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        match self.mode {
            ClusterMode::Direct => self.connect_node(0).await,
            ClusterMode::ReplicaSet | ClusterMode::Sharded => self.scan().await,
        }
    }

    async fn disconnect_node(&mut self, index: usize) {
        debug!(node = %self.nodes[index].address, "disconnecting node");
        let requires_auth = self.requires_auth;
        self.nodes[index].disconnect(requires_auth).await;
    }

    /// Connects, probes, and authenticates a single node.
    async fn connect_node(&mut self, index: usize) -> Result<()> {
        let address = self.nodes[index].address.clone();
        let stream = AsyncStream::connect(
            &address,
            self.options.connect_timeout,
            self.tls_config.as_ref(),
        )
        .await?;
        self.nodes[index].attach_stream(stream);

        let started = Instant::now();
        let probe = async {
            let reply = self.node_run_command(index, "admin", doc! { "ismaster": 1 }).await?;
            let reply: IsMasterReply = bson::from_document(reply)?;
            Ok::<IsMasterReply, Error>(reply)
        }
        .await;

        match probe {
            Ok(reply) => {
                self.nodes[index].ping = Some(started.elapsed());
                self.apply_ismaster(index, &reply);
            }
            Err(error) => {
                self.disconnect_node(index).await;
                return Err(error);
            }
        }

        if self.nodes[index].needs_auth {
            if let Err(error) = self.auth_node(index).await {
                self.disconnect_node(index).await;
                return Err(error);
            }
        }

        Ok(())
    }

    /// Probes every unconnected seed in parallel, adopting the streams of the
    /// nodes that answer and classifying their roles.
    async fn scan(&mut self) -> Result<()> {
        let mut scanner = Scanner::new();
        let probe_timeout = self
            .options
            .connect_timeout
            .unwrap_or(Duration::from_secs(10))
            + Duration::from_secs(10);

        let mut queued = 0;
        for index in 0..self.nodes.len() {
            if self.nodes[index].has_stream() {
                continue;
            }
            let address = self.nodes[index].address.clone();
            let tls = self
                .tls_config
                .clone()
                .map(|config| (config, address.host_str().to_string()));
            let request_id = self.next_request_id();
            scanner.probe(
                index,
                address,
                self.options.connect_timeout,
                tls,
                "admin",
                &doc! { "ismaster": 1 },
                probe_timeout,
                request_id,
            )?;
            queued += 1;
        }

        if queued == 0 {
            return Ok(());
        }

        for outcome in scanner.run().await {
            let index = outcome.token;
            match outcome.result {
                Ok(success) => {
                    let reply: IsMasterReply = match bson::from_document(success.document) {
                        Ok(reply) => reply,
                        Err(error) => {
                            warn!(node = %self.nodes[index].address, %error, "invalid ismaster reply");
                            continue;
                        }
                    };

                    if let (Some(expected), Some(actual)) =
                        (self.options.repl_set_name.as_deref(), reply.set_name.as_deref())
                    {
                        if expected != actual {
                            warn!(
                                node = %self.nodes[index].address,
                                expected,
                                actual,
                                "node belongs to a different replica set"
                            );
                            continue;
                        }
                    }

                    self.nodes[index].attach_stream(success.stream);
                    self.nodes[index].ping = Some(outcome.round_trip);
                    self.apply_ismaster(index, &reply);
                }
                Err(error) => {
                    debug!(node = %self.nodes[index].address, %error, "node probe failed");
                }
            }
        }

        for index in 0..self.nodes.len() {
            if self.nodes[index].has_stream() && self.nodes[index].needs_auth {
                if let Err(error) = self.auth_node(index).await {
                    self.disconnect_node(index).await;
                    return Err(error);
                }
            }
        }

        if !self.is_connected() {
            return Err(ErrorKind::ServerSelection {
                message: "no configured host answered the topology scan".to_string(),
            }
            .into());
        }

        Ok(())
    }

    fn apply_ismaster(&mut self, index: usize, reply: &IsMasterReply) {
        let node = &mut self.nodes[index];
        node.primary = reply.is_primary();
        if let Some(ref tags) = reply.tags {
            node.tags = tags.clone();
        }
        if let Some(size) = reply.max_bson_object_size {
            node.max_bson_size = size;
            self.max_bson_size = size;
        }
        if let Some(size) = reply.max_message_size_bytes {
            node.max_msg_size = size;
            self.max_msg_size = size;
        }
        if let Some(version) = reply.max_wire_version {
            self.wire_version = version;
        }
    }

    /// The challenge-response handshake: fetch a nonce, answer with the
    /// digest, verify the server accepted it.
    async fn auth_node(&mut self, index: usize) -> Result<()> {
        let (username, password, source) = match self.options.credential {
            Some(ref credential) => (
                credential.username.clone(),
                credential.password.clone(),
                credential.source_db().to_string(),
            ),
            None => return Ok(()),
        };

        let reply = self
            .node_run_command(index, &source, doc! { "getnonce": 1 })
            .await?;
        let nonce = match reply.get_str("nonce") {
            Ok(nonce) => nonce.to_string(),
            Err(_) => {
                return Err(ErrorKind::Authentication {
                    message: "invalid reply to getnonce".to_string(),
                }
                .into())
            }
        };

        let key = auth::build_basic_auth_digest(&username, &password, &nonce);
        let command = doc! {
            "authenticate": 1,
            "user": &username,
            "nonce": &nonce,
            "key": key,
        };

        let reply = self.node_run_command(index, &source, command).await?;
        let ok = reply.get("ok").and_then(crate::bson_util::as_bool).unwrap_or(false);
        if !ok {
            return Err(Error::authentication_error(
                "server rejected the supplied credentials",
            ));
        }

        let node = &mut self.nodes[index];
        node.needs_auth = false;
        node.stamp = node.stamp.wrapping_add(1);
        debug!(node = %node.address, "node authenticated");
        Ok(())
    }

    /// Runs `command` against `db.$cmd` on a specific node, bypassing
    /// selection. Used for the handshake and authentication.
    async fn node_run_command(
        &mut self,
        index: usize,
        db: &str,
        command: Document,
    ) -> Result<Document> {
        let namespace = format!("{}.$cmd", db);
        let query = bson::to_vec(&command)?;
        let mut rpc = Rpc::new(RpcBody::Query(Query {
            flags: QueryFlags::empty(),
            namespace: &namespace,
            skip: 0,
            num_to_return: -1,
            query: &query,
            fields: None,
        }));
        rpc.request_id = self.next_request_id();

        let socket_timeout = self.socket_timeout;
        let result = async {
            let gathered = rpc.gather();
            let mut iovs = Vec::new();
            gathered.extend_io_slices(&mut iovs);

            let node = &mut self.nodes[index];
            node.write_iovs(&iovs, socket_timeout).await?;
            let reply = node.read_reply(socket_timeout).await?;

            if reply.response_to != rpc.request_id {
                return Err(Error::invalid_response(format!(
                    "reply answers request {} but {} was sent",
                    reply.response_to, rpc.request_id
                )));
            }
            reply.check_failure_flags()?;

            let raw = reply
                .first_document()?
                .ok_or_else(|| Error::invalid_response("command reply carried no document"))?;
            Ok(bson::from_slice(raw.as_bytes())?)
        }
        .await;

        if let Err(ref error) = result {
            if error.is_network_error() {
                self.disconnect_node(index).await;
            }
        }
        result
    }

    /// Runs `command` against `db.$cmd` on a selected node and interprets the
    /// reply, surfacing `{ok: 0}` as a command error.
    pub(crate) async fn command(
        &mut self,
        db: &str,
        command: &Document,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<Document> {
        self.command_with_hint(db, command, read_prefs)
            .await
            .map(|(_, document)| document)
    }

    /// Like [`Cluster::command`], also reporting which node served the
    /// command so cursor-bearing replies can be followed up on the same
    /// connection.
    pub(crate) async fn command_with_hint(
        &mut self,
        db: &str,
        command: &Document,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<(u32, Document)> {
        let namespace = format!("{}.$cmd", db);
        let query = bson::to_vec(command)?;

        let secondary_ok = matches!(self.mode, ClusterMode::Direct)
            || read_prefs.map(ReadPreference::is_secondary_ok).unwrap_or(false);
        let flags = if secondary_ok {
            QueryFlags::SLAVE_OK
        } else {
            QueryFlags::empty()
        };

        let mut batch = [Rpc::new(RpcBody::Query(Query {
            flags,
            namespace: &namespace,
            skip: 0,
            num_to_return: -1,
            query: &query,
            fields: None,
        }))];

        let exchange = self.operate(&mut batch, 0, None, read_prefs).await?;
        let reply = exchange
            .reply
            .ok_or_else(|| Error::internal("command exchange produced no reply"))?;
        reply.check_failure_flags()?;

        let raw = reply
            .first_document()?
            .ok_or_else(|| Error::invalid_response("command reply carried no document"))?;
        let document: Document = bson::from_slice(raw.as_bytes())?;

        let ok = document.get("ok").and_then(crate::bson_util::as_bool).unwrap_or(false);
        if !ok {
            let code = document.get_i32("code").unwrap_or(0);
            let message = document
                .get_str("errmsg")
                .unwrap_or("command failed")
                .to_string();
            return Err(Error::new(ErrorKind::Command(crate::error::CommandError {
                code,
                message,
            })));
        }

        Ok((exchange.hint, document))
    }

    /// Sends a batch and reads the correlated reply when the batch calls for
    /// one: queries and GET_MOREs always do, and acknowledged writes read
    /// back their getLastError result.
    pub(crate) async fn operate(
        &mut self,
        rpcs: &mut [Rpc<'_>],
        hint: u32,
        write_concern: Option<&WriteConcern>,
        read_prefs: Option<&ReadPreference>,
    ) -> Result<Exchange> {
        let report = self.sendv(rpcs, hint, write_concern, read_prefs, true).await?;

        let expects_reply = report.gle_request_id.is_some()
            || rpcs
                .iter()
                .any(|rpc| matches!(rpc.body, RpcBody::Query(..) | RpcBody::GetMore(..)));
        if !expects_reply {
            return Ok(Exchange {
                hint: report.hint,
                reply: None,
            });
        }

        let reply = self.recv(report.hint).await?;

        // A reply must answer the request that solicited it: the trailing
        // getLastError for writes, the query or GET_MORE otherwise.
        let expected = report.gle_request_id.or_else(|| {
            rpcs.iter()
                .rev()
                .find(|rpc| matches!(rpc.body, RpcBody::Query(..) | RpcBody::GetMore(..)))
                .map(|rpc| rpc.request_id)
        });
        if let Some(expected) = expected {
            if reply.response_to != expected {
                self.disconnect_hint(report.hint).await;
                return Err(Error::invalid_response(format!(
                    "reply answers request {} but {} was sent",
                    reply.response_to, expected
                )));
            }
        }

        Ok(Exchange {
            hint: report.hint,
            reply: Some(reply),
        })
    }

    /// Fire-and-forget release of server-side cursors, routed to the node
    /// that owns them.
    pub(crate) async fn kill_cursors(&mut self, hint: u32, cursor_ids: Vec<i64>) -> Result<()> {
        let mut rpc = Rpc::new(RpcBody::KillCursors(KillCursors { cursor_ids }));
        self.sendv(std::slice::from_mut(&mut rpc), hint, None, None, false)
            .await
            .map(|_| ())
    }

    async fn disconnect_hint(&mut self, hint: u32) {
        if let Some(index) = (hint as usize).checked_sub(1) {
            if index < self.nodes.len() {
                self.disconnect_node(index).await;
            }
        }
    }

    /// Routes and writes a batch in one vectored write, appending a
    /// getLastError query after each write that demands acknowledgement.
    /// Returns the 1-based hint of the serving node.
    async fn sendv(
        &mut self,
        rpcs: &mut [Rpc<'_>],
        hint: u32,
        write_concern: Option<&WriteConcern>,
        read_prefs: Option<&ReadPreference>,
        allow_reconnect: bool,
    ) -> Result<SendReport> {
        if rpcs.is_empty() {
            return Err(Error::invalid_argument("empty message batch"));
        }

        let mut retry_count = 0;
        let node_index = loop {
            match self.select(rpcs, hint, read_prefs) {
                Some(index) => break index,
                None if allow_reconnect && retry_count < MAX_RETRY_COUNT => {
                    retry_count += 1;
                    self.reconnect().await?;
                }
                None => {
                    return Err(ErrorKind::ServerSelection {
                        message: "no suitable node is available for the operation".to_string(),
                    }
                    .into())
                }
            }
        };

        for rpc in rpcs.iter_mut() {
            rpc.request_id = self.next_request_id();
        }

        // Owned getLastError payloads must outlive the gathered borrows.
        struct GlePayload {
            after: usize,
            namespace: String,
            selector: Vec<u8>,
            request_id: i32,
        }

        let mut gles: Vec<GlePayload> = Vec::new();
        if let Some(write_concern) = write_concern {
            if write_concern.requires_acknowledgment() {
                let selector = bson::to_vec(&write_concern.to_gle_document())?;
                for (index, rpc) in rpcs.iter().enumerate() {
                    if !rpc.is_write() {
                        continue;
                    }
                    let namespace = rpc
                        .namespace()
                        .ok_or_else(|| Error::internal("write message without a namespace"))?;
                    let db = namespace.split('.').next().unwrap_or(namespace);
                    gles.push(GlePayload {
                        after: index,
                        namespace: format!("{}.$cmd", db),
                        selector: selector.clone(),
                        request_id: self.next_request_id(),
                    });
                }
            }
        }

        let mut gathered: Vec<GatheredRpc<'_>> = Vec::new();
        let mut gle_iter = gles.iter().peekable();
        for (index, rpc) in rpcs.iter().enumerate() {
            gathered.push(rpc.gather());
            if let Some(gle) = gle_iter.peek() {
                if gle.after == index {
                    let mut gle_rpc = Rpc::new(RpcBody::Query(Query {
                        flags: QueryFlags::empty(),
                        namespace: &gle.namespace,
                        skip: 0,
                        num_to_return: 1,
                        query: &gle.selector,
                        fields: None,
                    }));
                    gle_rpc.request_id = gle.request_id;
                    gathered.push(gle_rpc.gather());
                    gle_iter.next();
                }
            }
        }

        for one in &gathered {
            if one.message_length() > self.max_msg_size {
                return Err(ErrorKind::MessageSize {
                    message: format!(
                        "message of {} bytes exceeds the deployment limit of {}",
                        one.message_length(),
                        self.max_msg_size
                    ),
                }
                .into());
            }
        }

        let mut iovs = Vec::new();
        for one in &gathered {
            one.extend_io_slices(&mut iovs);
        }

        let socket_timeout = self.socket_timeout;
        let write_result = self.nodes[node_index].write_iovs(&iovs, socket_timeout).await;
        if let Err(error) = write_result {
            self.disconnect_node(node_index).await;
            return Err(error);
        }

        Ok(SendReport {
            hint: node_index as u32 + 1,
            gle_request_id: gles.last().map(|gle| gle.request_id),
        })
    }

    /// Reads one reply from the hinted node. Any failure poisons the
    /// connection: the node is disconnected and its stamp bumped.
    pub(crate) async fn recv(&mut self, hint: u32) -> Result<OwnedReply> {
        let index = (hint as usize)
            .checked_sub(1)
            .filter(|&i| i < self.nodes.len())
            .ok_or_else(|| Error::invalid_argument(format!("invalid node hint {}", hint)))?;

        if !self.nodes[index].has_stream() {
            return Err(ErrorKind::ServerSelection {
                message: "failed to receive message, lost connection to node".to_string(),
            }
            .into());
        }

        let socket_timeout = self.socket_timeout;
        match self.nodes[index].read_reply(socket_timeout).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                warn!(node = %self.nodes[index].address, %error, "dropping connection after receive failure");
                self.disconnect_node(index).await;
                Err(error)
            }
        }
    }

    /// Chooses a node for a batch.
    ///
    /// Writes and non-slave-OK queries pin to the primary. Otherwise the
    /// hinted node wins, then candidates are filtered by tags and latency and
    /// one survivor is chosen uniformly at random.
    fn select(
        &mut self,
        rpcs: &[Rpc<'_>],
        hint: u32,
        read_prefs: Option<&ReadPreference>,
    ) -> Option<usize> {
        if self.mode == ClusterMode::Direct {
            return self.nodes.first().filter(|node| node.has_stream()).map(|_| 0);
        }

        let mut need_primary = read_prefs
            .map(ReadPreference::requires_primary)
            .unwrap_or(false);
        for rpc in rpcs {
            match rpc.body {
                RpcBody::Insert(..) | RpcBody::Update(..) | RpcBody::Delete(..) => {
                    need_primary = true
                }
                RpcBody::Query(ref query) if !query.flags.contains(QueryFlags::SLAVE_OK) => {
                    need_primary = true
                }
                _ => {}
            }
        }

        if need_primary {
            return self
                .nodes
                .iter()
                .position(|node| node.has_stream() && node.primary);
        }

        if hint != 0 {
            let index = hint as usize - 1;
            return match self.nodes.get(index) {
                Some(node) if node.has_stream() => Some(index),
                _ => None,
            };
        }

        let mut candidates: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].has_stream())
            .collect();

        if let Some(read_prefs) = read_prefs {
            candidates.retain(|&i| read_prefs.tags_match(&self.nodes[i].tags));

            // The preferred category wins outright; the other serves only
            // when the preferred one has no candidates.
            match read_prefs {
                ReadPreference::Secondary { .. } => {
                    candidates.retain(|&i| !self.nodes[i].primary);
                }
                ReadPreference::SecondaryPreferred { .. } => {
                    if candidates.iter().any(|&i| !self.nodes[i].primary) {
                        candidates.retain(|&i| !self.nodes[i].primary);
                    }
                }
                ReadPreference::PrimaryPreferred { .. } => {
                    if candidates.iter().any(|&i| self.nodes[i].primary) {
                        candidates.retain(|&i| self.nodes[i].primary);
                    }
                }
                ReadPreference::Primary | ReadPreference::Nearest { .. } => {}
            }
        }

        // Unmeasured nodes count as farther than any measured node, so they
        // never define the nearest; they survive the watermark themselves.
        let nearest = candidates
            .iter()
            .filter_map(|&i| self.nodes[i].ping)
            .min();
        if let Some(nearest) = nearest {
            let watermark = nearest + self.sec_latency;
            candidates.retain(|&i| match self.nodes[i].ping {
                Some(ping) => ping <= watermark,
                None => true,
            });
        }

        if candidates.is_empty() {
            return None;
        }
        let winner = self.rng.random_range(0..candidates.len());
        Some(candidates[winner])
    }
}
