use std::convert::Infallible;

use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use crate::error::{ChannelError, ChannelResult};
use crate::session::SessionId;
use crate::wire;

/// Ceiling on unacknowledged bytes carried by a single back channel. Once a
/// flush pushes the mirror past this, the channel detaches it and waits for
/// the client to reconnect; the value tracks the reference client's window.
pub(crate) const MAX_OUTSTANDING_BYTES: usize = 37 * 1024;

/// The write side of one streaming HTTP response. The response body is a
/// channel-fed stream; the serving task finishes when the sender is dropped,
/// which is how the owning channel releases a supplanted or finished request.
pub(crate) struct BackChannel {
    sid: SessionId,
    request_id: String,
    html: bool,
    chunked: bool,
    tx: Option<mpsc::UnboundedSender<Result<Bytes, Infallible>>>,
    unacked_bytes: usize,
    /// Highest array id written on this response. A fresh back channel starts
    /// at zero so everything unacknowledged is retransmitted to it.
    last_sent: u64,
}

impl BackChannel {
    /// Builds the back channel and the body to hand to the HTTP layer. In
    /// HTML mode the envelope head, the optional `document.domain` block and
    /// the anti-buffering padding are queued up front.
    pub fn new(
        sid: SessionId,
        html: bool,
        domain: Option<&str>,
        chunked: bool,
        request_id: String,
    ) -> (Self, Body) {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = Body::from_stream(UnboundedReceiverStream::new(rx));
        let mut bc = Self {
            sid,
            request_id,
            html,
            chunked,
            tx: Some(tx),
            unacked_bytes: 0,
            last_sent: 0,
        };
        if html {
            let mut head = String::from(wire::HTML_HEAD);
            match domain {
                Some(d) if !d.is_empty() => head.push_str(&wire::html_domain(d)),
                _ => {}
            }
            head.push_str(&wire::html_padding());
            let _ = bc.write(head.into());
        }
        (bc, body)
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_html(&self) -> bool {
        self.html
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    /// Mirrors the queue's outstanding byte count after a flush.
    pub fn note_unacked(&mut self, bytes: usize) {
        self.unacked_bytes = bytes;
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn note_sent(&mut self, array_id: u64) {
        self.last_sent = self.last_sent.max(array_id);
    }

    /// Writes one framed batch. A send failure means the HTTP layer dropped
    /// the body (client gone) and detaches the back channel.
    pub fn send_frame(&mut self, batch_json: &str) -> ChannelResult<()> {
        let framed = if self.html {
            wire::html_rpc(batch_json)
        } else {
            wire::length_prefixed(batch_json)
        };
        trace!(sid = %self.sid, rid = %self.request_id, bytes = framed.len(), "back channel write");
        self.write(framed.into())
    }

    /// Ends the response stream. Safe to call more than once; writes after
    /// close are discarded.
    pub fn close(&mut self) {
        if self.html {
            let _ = self.write(Bytes::from_static(wire::html_done().as_bytes()));
        }
        self.tx = None;
    }

    fn write(&mut self, bytes: Bytes) -> ChannelResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(());
        };
        if tx.send(Ok(bytes)).is_err() {
            self.tx = None;
            return Err(ChannelError::BackChannelBroken);
        }
        Ok(())
    }
}

impl Drop for BackChannel {
    fn drop(&mut self) {
        self.close();
    }
}
