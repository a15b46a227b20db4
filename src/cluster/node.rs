use std::time::Duration;

use tokio::time::timeout;

use crate::{
    buffer::ReadBuffer,
    client::options::ServerAddress,
    error::{Error, ErrorKind, Result},
    runtime::{write_all_vectored, AsyncStream},
    selection_criteria::TagSet,
    wire::{Header, OwnedReply, Rpc},
};

/// One member of the cluster.
///
/// The stamp is a monotonic counter incremented on every state-changing
/// event: a new stream, a disconnect, or a completed authentication. Cursors
/// record it so a GET_MORE can detect that the connection underneath them was
/// replaced.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) address: ServerAddress,
    pub(crate) stream: Option<AsyncStream>,
    pub(crate) buffer: ReadBuffer,
    pub(crate) primary: bool,
    /// Round-trip time of the last probe; `None` means unmeasured, which is
    /// treated as farther than any measured node during selection.
    pub(crate) ping: Option<Duration>,
    pub(crate) stamp: u32,
    pub(crate) needs_auth: bool,
    pub(crate) tags: TagSet,
    pub(crate) max_bson_size: i32,
    pub(crate) max_msg_size: i32,
}

impl Node {
    pub(crate) fn new(address: ServerAddress, requires_auth: bool) -> Self {
        Self {
            address,
            stream: None,
            buffer: ReadBuffer::new(),
            primary: false,
            ping: None,
            stamp: 0,
            needs_auth: requires_auth,
            tags: TagSet::new(),
            max_bson_size: crate::wire::DEFAULT_MAX_BSON_SIZE,
            max_msg_size: crate::wire::MAX_MESSAGE_SIZE,
        }
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Installs a freshly-connected stream, bumping the stamp.
    pub(crate) fn attach_stream(&mut self, stream: AsyncStream) {
        self.buffer.clear();
        self.stream = Some(stream);
        self.stamp = self.stamp.wrapping_add(1);
    }

    /// Drops the stream and resets discovered state, bumping the stamp.
    pub(crate) async fn disconnect(&mut self, requires_auth: bool) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
        self.buffer.clear();
        self.primary = false;
        self.ping = None;
        self.needs_auth = requires_auth;
        self.tags.clear();
        self.stamp = self.stamp.wrapping_add(1);
    }

    /// Writes a gathered batch to the stream in one vectored write.
    pub(crate) async fn write_iovs(
        &mut self,
        iovs: &[std::io::IoSlice<'_>],
        socket_timeout: Duration,
    ) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| not_connected(&self.address))?;

        timeout(socket_timeout, write_all_vectored(stream, iovs))
            .await
            .map_err(|_| Error::network_timeout())?
    }

    /// Reads one complete message from the stream: a 4-byte length prefix
    /// validated against `[16, max_msg_size]`, then the remainder, scattered
    /// into an owned reply.
    pub(crate) async fn read_reply(&mut self, socket_timeout: Duration) -> Result<OwnedReply> {
        let max_msg_size = self.max_msg_size;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| not_connected(&self.address))?;

        timeout(socket_timeout, async {
            self.buffer.fill_to(stream, 4).await?;
            let head = self.buffer.bytes();
            let msg_len = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);

            if msg_len < Header::LENGTH as i32 || msg_len > max_msg_size {
                return Err(ErrorKind::MessageSize {
                    message: format!(
                        "reply length {} is outside the valid range [{}, {}]",
                        msg_len,
                        Header::LENGTH,
                        max_msg_size
                    ),
                }
                .into());
            }

            self.buffer.fill_to(stream, msg_len as usize).await?;
            let message = self.buffer.consume(msg_len as usize);
            let rpc = Rpc::scatter(message)?;
            OwnedReply::from_rpc(&rpc)
        })
        .await
        .map_err(|_| Error::network_timeout())?
    }
}

fn not_connected(address: &ServerAddress) -> Error {
    Error::new(ErrorKind::ServerSelection {
        message: format!("lost connection to {}", address),
    })
}
