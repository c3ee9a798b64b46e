use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backchannel::{BackChannel, MAX_OUTSTANDING_BYTES};
use crate::config::ChannelTimeouts;
use crate::error::{ChannelError, ChannelResult};
use crate::queue::OutgoingQueue;
use crate::session::SessionId;
use crate::wire::{self, Map};
use crate::SUPPORTED_PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Session,
    Heartbeat,
    DeadClient,
}

/// One-shot timer slot. The epoch guards against stale fires: arming or
/// cancelling bumps it, and a fired task whose epoch no longer matches is a
/// no-op even if it slipped past the abort.
#[derive(Default)]
struct TimerSlot {
    epoch: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn cancel(&mut self) {
        self.epoch += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Session status reported on non-initial forward-channel responses.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub has_back_channel: bool,
    pub last_sent_array_id: u64,
    pub outstanding_bytes: usize,
}

struct ChannelState {
    phase: Phase,
    queue: OutgoingQueue,
    /// Offset the next client map batch must start at.
    next_map_offset: u64,
    back: Option<BackChannel>,
    last_sent_array_id: u64,
    maps_tx: Option<mpsc::UnboundedSender<Map>>,
    session_timer: TimerSlot,
    heartbeat_timer: TimerSlot,
    dead_client_timer: TimerSlot,
}

impl ChannelState {
    fn slot_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Session => &mut self.session_timer,
            TimerKind::Heartbeat => &mut self.heartbeat_timer,
            TimerKind::DeadClient => &mut self.dead_client_timer,
        }
    }
}

/// The per-session state machine: outgoing queue, back-channel slot, inbound
/// offset window and timers. All public operations serialize on the internal
/// mutex; the lock is never held across an await.
pub struct Channel {
    sid: SessionId,
    client_version: String,
    timeouts: ChannelTimeouts,
    gc_tx: mpsc::UnboundedSender<SessionId>,
    state: Mutex<ChannelState>,
    maps_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Map>>,
}

impl Channel {
    /// Creates the channel in Init with the configuration array already
    /// queued as array id 1, so the first back-channel attach delivers
    /// `["c", sid, host_prefix, version]` ahead of anything else.
    pub(crate) fn new(
        sid: SessionId,
        client_version: String,
        host_prefix: String,
        gc_tx: mpsc::UnboundedSender<SessionId>,
        timeouts: ChannelTimeouts,
    ) -> Arc<Self> {
        let (maps_tx, maps_rx) = mpsc::unbounded_channel();
        let mut queue = OutgoingQueue::new();
        queue.enqueue(json!([
            "c",
            sid.to_string(),
            host_prefix,
            SUPPORTED_PROTOCOL_VERSION
        ]));
        Arc::new(Self {
            sid,
            client_version,
            timeouts,
            gc_tx,
            state: Mutex::new(ChannelState {
                phase: Phase::Init,
                queue,
                next_map_offset: 0,
                back: None,
                last_sent_array_id: 0,
                maps_tx: Some(maps_tx),
                session_timer: TimerSlot::default(),
                heartbeat_timer: TimerSlot::default(),
                dead_client_timer: TimerSlot::default(),
            }),
            maps_rx: tokio::sync::Mutex::new(maps_rx),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.sid
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    /// Queues a server-to-client array and flushes it through the active
    /// back channel, if any. Returns the assigned array id.
    pub fn send_array(self: &Arc<Self>, payload: Value) -> ChannelResult<u64> {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return Err(ChannelError::ChannelClosed);
        }
        let id = st.queue.enqueue(payload);
        self.flush_locked(&mut st);
        if st.back.is_some() {
            self.arm_timer(&mut st, TimerKind::Heartbeat);
        }
        Ok(id)
    }

    /// Receives the next client-to-server map, in offset order. Returns
    /// `None` once the channel has terminated and the stream is drained.
    pub async fn recv_map(&self) -> Option<Map> {
        self.maps_rx.lock().await.recv().await
    }

    /// Closes the channel: drops the back channel, cancels timers, ends the
    /// inbound map stream and publishes the sid for garbage collection.
    /// Idempotent.
    pub fn terminate(&self) {
        let mut st = self.state.lock();
        self.terminate_locked(&mut st);
    }

    fn terminate_locked(&self, st: &mut ChannelState) {
        if st.phase == Phase::Closed {
            return;
        }
        st.phase = Phase::Closed;
        if let Some(mut back) = st.back.take() {
            back.close();
        }
        st.session_timer.cancel();
        st.heartbeat_timer.cancel();
        st.dead_client_timer.cancel();
        st.maps_tx = None;
        info!(sid = %self.sid, "channel closed");
        if self.gc_tx.send(self.sid).is_err() {
            warn!(sid = %self.sid, "gc loop is gone; session map entry leaks");
        }
    }

    /// Validates a batch of client maps against the offset window, map by
    /// map: maps behind the window are retransmitted duplicates and are
    /// dropped, maps at or past the window edge are delivered in order. A
    /// batch starting past the window is a gap; a non-empty batch with
    /// nothing new at all is stale.
    pub(crate) fn receive_maps(self: &Arc<Self>, offset: u64, maps: Vec<Map>) -> ChannelResult<()> {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return Err(ChannelError::ChannelClosed);
        }
        // Forward traffic keeps a not-yet-attached session alive.
        if st.phase == Phase::Init {
            self.arm_timer(&mut st, TimerKind::Session);
        }
        let expected = st.next_map_offset;
        if offset > expected {
            return Err(ChannelError::GapOffset { offset, expected });
        }
        let len = maps.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if offset + len <= expected {
            debug!(sid = %self.sid, offset, expected, "retransmitted batch has nothing new");
            return Err(ChannelError::StaleOffset { offset, expected });
        }
        let skip = (expected - offset) as usize;
        if skip > 0 {
            debug!(
                sid = %self.sid,
                offset,
                expected,
                skipped = skip,
                "dropping duplicate prefix of overlapping batch"
            );
        }
        if let Some(tx) = st.maps_tx.as_ref() {
            for map in maps.into_iter().skip(skip) {
                if tx.send(map).is_err() {
                    debug!(sid = %self.sid, "application stopped reading maps");
                    break;
                }
            }
        }
        st.next_map_offset = offset + len;
        Ok(())
    }

    /// Applies the client's `AID` acknowledgement. Monotonic; regressions
    /// and acks on a closed channel are ignored.
    pub(crate) fn acknowledge_arrays(self: &Arc<Self>, up_to: u64) {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return;
        }
        st.queue.acknowledge(up_to);
        let outstanding = st.queue.outstanding_bytes();
        if let Some(back) = st.back.as_mut() {
            back.note_unacked(outstanding);
        }
        if !st.queue.is_empty() {
            self.flush_locked(&mut st);
        }
    }

    /// True until the first back channel attaches. The dispatcher uses this
    /// to let the initial forward POST double as the config-array carrier.
    pub(crate) fn is_init(&self) -> bool {
        self.state.lock().phase == Phase::Init
    }

    pub(crate) fn state_snapshot(&self) -> StateSnapshot {
        let st = self.state.lock();
        StateSnapshot {
            has_back_channel: st.back.is_some(),
            last_sent_array_id: st.last_sent_array_id,
            outstanding_bytes: st.queue.outstanding_bytes(),
        }
    }

    /// Installs a new back channel, closing any previous one exactly once,
    /// and flushes whatever is unacknowledged. The first successful attach
    /// moves the channel from Init to Ready.
    pub(crate) fn set_back_channel(self: &Arc<Self>, back: BackChannel) {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            let mut back = back;
            back.close();
            return;
        }
        if let Some(mut previous) = st.back.take() {
            debug!(
                sid = %self.sid,
                old_rid = %previous.request_id(),
                new_rid = %back.request_id(),
                "back channel supplanted"
            );
            previous.close();
        }
        if st.phase == Phase::Init {
            st.phase = Phase::Ready;
            info!(sid = %self.sid, rid = %back.request_id(), "channel ready");
        }
        st.back = Some(back);
        st.session_timer.cancel();
        st.dead_client_timer.cancel();
        self.flush_locked(&mut st);
        if st.back.is_some() {
            self.arm_timer(&mut st, TimerKind::Heartbeat);
        }
    }

    /// Arms the Init-phase session timer; called once right after creation.
    pub(crate) fn arm_session_timer(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return;
        }
        self.arm_timer(&mut st, TimerKind::Session);
    }

    /// Writes every unacknowledged array the current back channel has not
    /// seen yet as one framed batch. Detaches the back channel when it is
    /// single-shot, over its byte window, or broken; detaching arms the
    /// dead-client timer.
    fn flush_locked(self: &Arc<Self>, st: &mut ChannelState) {
        let Some(mut back) = st.back.take() else {
            return;
        };
        // Ids start at 1, so 0 doubles as "nothing to send".
        let (batch, last_id) = {
            let pending: Vec<(u64, &Value)> = st
                .queue
                .drain()
                .filter(|array| array.id > back.last_sent())
                .map(|array| (array.id, &array.payload))
                .collect();
            match pending.last() {
                Some(&(last_id, _)) => (wire::encode_batch(&pending), last_id),
                None => (String::new(), 0),
            }
        };
        if last_id == 0 {
            st.back = Some(back);
            return;
        }
        match back.send_frame(&batch) {
            Ok(()) => {
                back.note_sent(last_id);
                back.note_unacked(st.queue.outstanding_bytes());
                st.last_sent_array_id = st.last_sent_array_id.max(last_id);
                if !back.is_chunked() {
                    debug!(sid = %self.sid, rid = %back.request_id(), "single-shot back channel done");
                    back.close();
                    self.arm_timer(st, TimerKind::DeadClient);
                } else if back.unacked_bytes() > MAX_OUTSTANDING_BYTES {
                    info!(
                        sid = %self.sid,
                        unacked = back.unacked_bytes(),
                        "back channel over byte window, forcing reconnect"
                    );
                    back.close();
                    self.arm_timer(st, TimerKind::DeadClient);
                } else {
                    st.back = Some(back);
                }
            }
            Err(_) => {
                warn!(sid = %self.sid, rid = %back.request_id(), "back channel broken during flush");
                self.arm_timer(st, TimerKind::DeadClient);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, st: &mut ChannelState, kind: TimerKind) {
        let duration = match kind {
            TimerKind::Session => self.timeouts.session,
            TimerKind::Heartbeat => self.timeouts.heartbeat,
            TimerKind::DeadClient => self.timeouts.dead_client,
        };
        let slot = st.slot_mut(kind);
        slot.cancel();
        let epoch = slot.epoch;
        let channel = Arc::clone(self);
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            channel.timer_fired(kind, epoch);
        }));
    }

    fn timer_fired(self: &Arc<Self>, kind: TimerKind, epoch: u64) {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed || st.slot_mut(kind).epoch != epoch {
            return;
        }
        match kind {
            TimerKind::Session => {
                info!(sid = %self.sid, "session timed out");
                self.terminate_locked(&mut st);
            }
            TimerKind::DeadClient => {
                info!(sid = %self.sid, "client did not reopen a back channel");
                self.terminate_locked(&mut st);
            }
            TimerKind::Heartbeat => self.heartbeat_locked(&mut st),
        }
    }

    /// Keeps an attached, idle back channel warm with an empty batch. Idle
    /// means nothing unsent to this response; unacknowledged entries the
    /// client has already received are not pending traffic.
    fn heartbeat_locked(self: &Arc<Self>, st: &mut ChannelState) {
        let Some(mut back) = st.back.take() else {
            return;
        };
        let idle = st.queue.drain().all(|array| array.id <= back.last_sent());
        if idle {
            if back.send_frame("[]").is_err() {
                warn!(sid = %self.sid, "back channel broken during heartbeat");
                self.arm_timer(st, TimerKind::DeadClient);
                return;
            }
        }
        st.back = Some(back);
        self.arm_timer(st, TimerKind::Heartbeat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelTimeouts;
    use std::time::Duration;

    fn test_channel() -> (Arc<Channel>, mpsc::UnboundedReceiver<SessionId>) {
        let (gc_tx, gc_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(
            SessionId::generate(),
            "8".into(),
            String::new(),
            gc_tx,
            ChannelTimeouts {
                session: Duration::from_secs(60),
                heartbeat: Duration::from_secs(60),
                dead_client: Duration::from_secs(60),
            },
        );
        (channel, gc_rx)
    }

    fn map(entries: &[(&str, &str)]) -> Map {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn maps_reach_the_application_once_and_in_order() {
        let (channel, _gc) = test_channel();
        channel
            .receive_maps(0, vec![map(&[("a", "1")]), map(&[("b", "2")])])
            .unwrap();
        // A full retransmit carries nothing new and is reported stale.
        let err = channel
            .receive_maps(0, vec![map(&[("a", "1")]), map(&[("b", "2")])])
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::StaleOffset {
                offset: 0,
                expected: 2
            }
        );
        channel.receive_maps(2, vec![map(&[("c", "3")])]).unwrap();

        let first = channel.recv_map().await.unwrap();
        let second = channel.recv_map().await.unwrap();
        let third = channel.recv_map().await.unwrap();
        assert_eq!(first["a"], "1");
        assert_eq!(second["b"], "2");
        assert_eq!(third["c"], "3");
    }

    #[tokio::test]
    async fn gapped_offsets_fail_without_advancing_the_window() {
        let (channel, _gc) = test_channel();
        let err = channel
            .receive_maps(5, vec![map(&[("x", "y")])])
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::GapOffset {
                offset: 5,
                expected: 0
            }
        );
        // The window did not move.
        channel.receive_maps(0, vec![map(&[("x", "y")])]).unwrap();
        assert_eq!(channel.recv_map().await.unwrap()["x"], "y");
    }

    #[tokio::test]
    async fn overlapping_batches_deliver_only_the_new_suffix() {
        let (channel, _gc) = test_channel();
        channel
            .receive_maps(0, vec![map(&[("a", "1")]), map(&[("b", "2")])])
            .unwrap();
        // The client re-sends map 1 together with the new map 2; only the
        // new one may reach the application.
        channel
            .receive_maps(1, vec![map(&[("b", "2")]), map(&[("c", "3")])])
            .unwrap();
        // The window has advanced past the overlap.
        channel.receive_maps(3, vec![map(&[("d", "4")])]).unwrap();

        assert_eq!(channel.recv_map().await.unwrap()["a"], "1");
        assert_eq!(channel.recv_map().await.unwrap()["b"], "2");
        assert_eq!(channel.recv_map().await.unwrap()["c"], "3");
        assert_eq!(channel.recv_map().await.unwrap()["d"], "4");
    }

    #[tokio::test]
    async fn terminate_publishes_the_sid_once_and_closes_the_stream() {
        let (channel, mut gc) = test_channel();
        channel.terminate();
        channel.terminate();
        assert_eq!(gc.recv().await, Some(channel.session_id()));
        assert!(gc.try_recv().is_err());
        assert!(channel.recv_map().await.is_none());
        assert_eq!(
            channel.send_array(json!(["late"])).unwrap_err(),
            ChannelError::ChannelClosed
        );
        assert_eq!(
            channel.receive_maps(0, vec![]).unwrap_err(),
            ChannelError::ChannelClosed
        );
    }

    #[tokio::test]
    async fn handover_closes_the_old_back_channel_and_keeps_the_queue() {
        let (channel, _gc) = test_channel();
        let sid = channel.session_id();
        let (b1, body1) = BackChannel::new(sid, false, None, true, "b1".into());
        channel.set_back_channel(b1);
        channel.send_array(json!({"k": 1})).unwrap();

        let (b2, body2) = BackChannel::new(sid, false, None, true, "b2".into());
        channel.set_back_channel(b2);
        channel.send_array(json!({"k": 2})).unwrap();
        channel.terminate();

        let first = axum::body::to_bytes(body1, usize::MAX).await.unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        // B1 saw the config array and the first payload, then ended cleanly.
        assert!(first.contains(r#"[[2,{"k":1}]]"#));

        let second = axum::body::to_bytes(body2, usize::MAX).await.unwrap();
        let second = String::from_utf8(second.to_vec()).unwrap();
        // B2 retransmits everything unacknowledged, including {"k":1}.
        assert!(second.contains(r#"{"k":1}"#));
        assert!(second.contains(r#"{"k":2}"#));
    }

    #[tokio::test]
    async fn acknowledged_arrays_are_not_retransmitted() {
        let (channel, _gc) = test_channel();
        let sid = channel.session_id();
        channel.send_array(json!({"k": 1})).unwrap();
        channel.acknowledge_arrays(2);
        assert_eq!(channel.state_snapshot().outstanding_bytes, 0);

        let (back, body) = BackChannel::new(sid, false, None, true, "b".into());
        channel.set_back_channel(back);
        channel.send_array(json!({"k": 2})).unwrap();
        channel.terminate();

        let text = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(!text.contains(r#"{"k":1}"#));
        assert!(text.contains(r#"[[3,{"k":2}]]"#));
    }

    #[tokio::test]
    async fn concurrent_batches_deliver_in_offset_order() {
        let (channel, _gc) = test_channel();

        // Two racing forward requests, each retrying on a gap the way the
        // client would, must never interleave or duplicate deliveries.
        let mut tasks = Vec::new();
        for (offset, key) in [(0u64, "first"), (1u64, "second")] {
            let channel = Arc::clone(&channel);
            tasks.push(tokio::spawn(async move {
                loop {
                    match channel.receive_maps(offset, vec![map(&[(key, "v")])]) {
                        Ok(()) => break,
                        Err(ChannelError::GapOffset { .. }) => tokio::task::yield_now().await,
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let first = channel.recv_map().await.unwrap();
        let second = channel.recv_map().await.unwrap();
        assert!(first.contains_key("first"));
        assert!(second.contains_key("second"));
    }

    #[tokio::test]
    async fn snapshot_reflects_queue_and_back_channel() {
        let (channel, _gc) = test_channel();
        let before = channel.state_snapshot();
        assert!(!before.has_back_channel);
        assert_eq!(before.last_sent_array_id, 0);
        assert!(before.outstanding_bytes > 0); // the config array

        let (back, _body) = BackChannel::new(channel.session_id(), false, None, true, "b".into());
        channel.set_back_channel(back);
        let after = channel.state_snapshot();
        assert!(after.has_back_channel);
        assert_eq!(after.last_sent_array_id, 1);
    }
}
