use crate::endpoint::{ChannelEvent, ChannelRx, ChannelTx, RelayEndpoint};
use crate::queue::SendQueue;
use bytes::Bytes;
use relay_proto::codec::{self, DecodeError};
use relay_proto::{CloseStatus, Disposition, Frame, RelayError, Result, MIN_READ_SIZE};
use std::collections::VecDeque;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a relay stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct Shared<Tx, Rx> {
    state: StreamState,
    tx: Option<Tx>,
    rx: Option<Rx>,
    /// Incremented on every installed channel; a half moved out for an await
    /// is only restored if the channel has not been replaced meanwhile.
    epoch: u64,
    session_id: Option<Bytes>,
    queue: SendQueue,
    /// Payloads still to be re-sent on the current channel after a resume.
    pending_replay: VecDeque<Bytes>,
    /// Set when a channel died before the session id arrived; the queue is
    /// replayed once the replacement session is established.
    replay_on_establish: bool,
    saw_data: bool,
    sent_any: bool,
    read_eof: bool,
    connects: u64,
    reconnects: u64,
}

/// A lossless, in-order byte stream relayed over a message channel.
///
/// Reads and writes are async and observe a caller-supplied cancellation
/// token. At most one read and one write may be in flight at a time; a read
/// and a write may proceed concurrently. Recoverable transport closes are
/// absorbed by resuming the session on a fresh channel and replaying every
/// unacknowledged payload; only an unrecoverable close reaches the caller.
pub struct RelayStream<E: RelayEndpoint> {
    endpoint: E,
    shared: Mutex<Shared<E::Tx, E::Rx>>,
    changed: Notify,
}

impl<E: RelayEndpoint> RelayStream<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            shared: Mutex::new(Shared {
                state: StreamState::NotConnected,
                tx: None,
                rx: None,
                epoch: 0,
                session_id: None,
                queue: SendQueue::default(),
                pending_replay: VecDeque::new(),
                replay_on_establish: false,
                saw_data: false,
                sent_any: false,
                read_eof: false,
                connects: 0,
                reconnects: 0,
            }),
            changed: Notify::new(),
        }
    }

    /// Smallest buffer `read` accepts: one maximal frame.
    pub fn min_read_size(&self) -> usize {
        MIN_READ_SIZE
    }

    pub async fn state(&self) -> StreamState {
        self.shared.lock().await.state
    }

    pub async fn unacknowledged_message_count(&self) -> usize {
        self.shared.lock().await.queue.len()
    }

    pub async fn expected_ack(&self) -> u64 {
        self.shared.lock().await.queue.expected_ack()
    }

    pub async fn connect_count(&self) -> u64 {
        self.shared.lock().await.connects
    }

    pub async fn reconnect_count(&self) -> u64 {
        self.shared.lock().await.reconnects
    }

    /// Eagerly performs the connect that `read`/`write` would otherwise do
    /// lazily.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        let shared = self.shared.lock().await;
        match shared.state {
            StreamState::Closed => Err(RelayError::StreamClosed),
            StreamState::NotConnected => self.connect_locked(shared, cancel).await,
            _ => Ok(()),
        }
    }

    /// Reads the next chunk of relayed bytes into `buf`. Returns 0 exactly
    /// once the server has finished the stream; 0 is terminal for reads.
    pub async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        if buf.len() < MIN_READ_SIZE {
            return Err(RelayError::BufferTooSmall {
                min: MIN_READ_SIZE,
                got: buf.len(),
            });
        }

        loop {
            let mut shared = self.shared.lock().await;
            match shared.state {
                StreamState::Closed => return Err(RelayError::StreamClosed),
                StreamState::NotConnected => {
                    self.connect_locked(shared, cancel).await?;
                    continue;
                }
                _ => {}
            }
            if shared.read_eof {
                return Ok(0);
            }
            if shared.state == StreamState::Reconnecting {
                if shared.rx.is_none() {
                    // A resume dial was cancelled part-way; pick it up again.
                    self.redial_locked(shared, cancel).await?;
                    continue;
                }
                if !shared.pending_replay.is_empty() {
                    self.drain_replay_locked(shared, cancel).await?;
                    continue;
                }
            }

            let Some(mut rx) = shared.rx.take() else {
                // A concurrent write is still dialing the channel.
                self.wait_changed(shared, cancel).await?;
                continue;
            };
            let epoch = shared.epoch;
            drop(shared);

            let received = {
                let recv = rx.receive();
                tokio::pin!(recv);
                tokio::select! {
                    event = &mut recv => Some(event),
                    _ = cancel.cancelled() => None,
                }
            };

            let mut shared = self.shared.lock().await;
            let Some(event) = received else {
                if shared.epoch == epoch {
                    shared.rx = Some(rx);
                }
                return Err(RelayError::Cancelled);
            };
            if shared.state == StreamState::Closed {
                return Err(RelayError::StreamClosed);
            }
            if shared.epoch == epoch {
                shared.rx = Some(rx);
            }

            let produced = match event {
                ChannelEvent::Message(msg) => self.on_message(shared, msg, buf, cancel).await?,
                ChannelEvent::Closed(status) => self.on_close(shared, status, cancel).await?,
            };
            if let Some(n) = produced {
                return Ok(n);
            }
        }
    }

    /// Sends `buf` as one DATA frame. Returns once the frame has been handed
    /// to the channel, not once it is acknowledged. Blocks while the stream
    /// is resuming a session.
    pub async fn write(&self, buf: &[u8], cancel: &CancellationToken) -> Result<()> {
        let payload = Bytes::copy_from_slice(buf);
        let frame = codec::encode_data(&payload)?;

        loop {
            let mut shared = self.shared.lock().await;
            match shared.state {
                StreamState::Closed => return Err(RelayError::StreamClosed),
                StreamState::NotConnected => {
                    self.connect_locked(shared, cancel).await?;
                    continue;
                }
                StreamState::Reconnecting => {
                    self.wait_changed(shared, cancel).await?;
                    continue;
                }
                StreamState::Connecting | StreamState::Connected => {}
            }
            let Some(mut tx) = shared.tx.take() else {
                // The channel is still being dialed.
                self.wait_changed(shared, cancel).await?;
                continue;
            };

            // Queued before the send so a racing resume replays the frame;
            // a stale send lands on a dead channel.
            shared.queue.append(payload);
            shared.sent_any = true;
            let epoch = shared.epoch;
            drop(shared);

            let sent = {
                let send = tx.send(frame);
                tokio::pin!(send);
                tokio::select! {
                    sent = &mut send => Some(sent),
                    _ = cancel.cancelled() => None,
                }
            };

            let mut shared = self.shared.lock().await;
            if shared.epoch == epoch {
                shared.tx = Some(tx);
            }
            drop(shared);
            self.changed.notify_waiters();

            match sent {
                None => return Err(RelayError::Cancelled),
                Some(Err(e)) => {
                    // The payload is queued; the read loop reconnects and
                    // replays it.
                    debug!(error = %e, "channel send failed, payload queued for replay");
                }
                Some(Ok(())) => {}
            }
            return Ok(());
        }
    }

    /// Sends a client-initiated close and marks the stream closed. Idempotent.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.state == StreamState::Closed {
            return Ok(());
        }
        shared.state = StreamState::Closed;
        shared.rx = None;
        shared.pending_replay.clear();
        let tx = shared.tx.take();
        drop(shared);
        self.changed.notify_waiters();

        if let Some(mut tx) = tx {
            tokio::select! {
                closed = tx.close() => {
                    if let Err(e) = closed {
                        debug!(error = %e, "close handshake failed");
                    }
                }
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            }
        }
        info!("relay stream closed");
        Ok(())
    }

    async fn on_message(
        &self,
        mut shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        msg: Bytes,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let mut src = msg;
        let frame = match codec::decode(&mut src) {
            Ok(frame) => frame,
            Err(DecodeError::UnsupportedTag(tag))
                if shared.state == StreamState::Connected =>
            {
                warn!(tag, "dropping message with unsupported tag");
                return Ok(None);
            }
            Err(e) => return self.fail(shared, e.into()),
        };

        match frame {
            Frame::ConnectSuccess { session_id } => match shared.state {
                StreamState::Connecting => {
                    info!("relay session established");
                    shared.session_id = Some(session_id);
                    shared.pending_replay = if shared.replay_on_establish {
                        shared.replay_on_establish = false;
                        shared.queue.replay().into()
                    } else {
                        VecDeque::new()
                    };
                    // Writes stay blocked until any replay has drained.
                    shared.state = StreamState::Reconnecting;
                    self.drain_replay_locked(shared, cancel).await?;
                    Ok(None)
                }
                StreamState::Reconnecting => {
                    // The server elected a fresh session instead of resuming;
                    // adopt it and replay everything still outstanding.
                    debug!("server issued a fresh session on resume");
                    shared.session_id = Some(session_id);
                    shared.pending_replay = shared.queue.replay().into();
                    self.drain_replay_locked(shared, cancel).await?;
                    Ok(None)
                }
                _ => self.fail(
                    shared,
                    RelayError::InvalidServerResponse("unexpected session-id message".into()),
                ),
            },
            Frame::ReconnectSuccess { acked } => {
                if shared.state != StreamState::Reconnecting {
                    return self.fail(
                        shared,
                        RelayError::InvalidServerResponse("unexpected resume ack".into()),
                    );
                }
                if let Err(e) = shared.queue.resume_to(acked) {
                    return self.fail(shared, e);
                }
                debug!(acked, outstanding = shared.queue.len(), "session resumed by server");
                shared.pending_replay = shared.queue.replay().into();
                self.drain_replay_locked(shared, cancel).await?;
                Ok(None)
            }
            Frame::Data { payload } => {
                if shared.state != StreamState::Connected {
                    return self.fail(
                        shared,
                        RelayError::InvalidServerResponse(
                            "data before session established".into(),
                        ),
                    );
                }
                shared.saw_data = true;
                if payload.is_empty() {
                    debug!("ignoring empty data frame");
                    return Ok(None);
                }
                if payload.len() > buf.len() {
                    // Unreachable given the MIN_READ_SIZE precondition.
                    return Err(RelayError::BufferTooSmall {
                        min: payload.len(),
                        got: buf.len(),
                    });
                }
                buf[..payload.len()].copy_from_slice(&payload);
                Ok(Some(payload.len()))
            }
            Frame::Ack { acked } => {
                if shared.state != StreamState::Connected {
                    return self.fail(
                        shared,
                        RelayError::InvalidServerResponse("ack before session established".into()),
                    );
                }
                match shared.queue.trim_to(acked) {
                    Ok(discarded) => {
                        debug!(acked, discarded, "ack trimmed send queue");
                        Ok(None)
                    }
                    Err(e) => self.fail(shared, e),
                }
            }
        }
    }

    async fn on_close(
        &self,
        mut shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        status: CloseStatus,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        if shared.state == StreamState::Reconnecting {
            // Any close while resuming means the session cannot be recovered.
            return self.fail(shared, RelayError::ServerClosedStream(status));
        }
        match status.disposition() {
            Disposition::EndOfStream => {
                debug!(%status, "server finished the stream");
                shared.rx = None;
                shared.read_eof = true;
                Ok(Some(0))
            }
            Disposition::Fatal => self.fail(shared, RelayError::ServerClosedStream(status)),
            Disposition::Recoverable => {
                shared.tx = None;
                shared.rx = None;
                if !shared.saw_data && !shared.sent_any {
                    info!(%status, "transport lost before any traffic, starting a fresh session");
                    shared.session_id = None;
                    self.connect_locked(shared, cancel).await?;
                    return Ok(None);
                }
                if shared.session_id.is_none() {
                    // Data was written but no session id ever arrived; there
                    // is nothing to resume, so start over and replay once the
                    // new session is established.
                    info!(%status, "transport lost before session establishment, starting over");
                    shared.replay_on_establish = true;
                    self.connect_locked(shared, cancel).await?;
                    return Ok(None);
                }
                info!(%status, "transport lost, resuming session");
                shared.state = StreamState::Reconnecting;
                self.redial_locked(shared, cancel).await?;
                Ok(None)
            }
        }
    }

    /// Dials a brand-new session. Call with the guard held; the guard is
    /// released across the dial.
    async fn connect_locked(
        &self,
        mut shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        shared.state = StreamState::Connecting;
        drop(shared);

        let dialed = tokio::select! {
            dialed = self.endpoint.connect() => dialed,
            _ = cancel.cancelled() => {
                let mut shared = self.shared.lock().await;
                if shared.state == StreamState::Connecting && shared.rx.is_none() {
                    shared.state = StreamState::NotConnected;
                }
                drop(shared);
                self.changed.notify_waiters();
                return Err(RelayError::Cancelled);
            }
        };

        let mut shared = self.shared.lock().await;
        if shared.state == StreamState::Closed {
            return Err(RelayError::StreamClosed);
        }
        match dialed {
            Ok((tx, rx)) => {
                shared.epoch += 1;
                shared.connects += 1;
                shared.tx = Some(tx);
                shared.rx = Some(rx);
                debug!(connects = shared.connects, "relay channel established");
                drop(shared);
                self.changed.notify_waiters();
                Ok(())
            }
            Err(e) => {
                // No built-in retry; the caller may try again.
                if shared.state == StreamState::Connecting {
                    shared.state = StreamState::NotConnected;
                }
                drop(shared);
                self.changed.notify_waiters();
                Err(e)
            }
        }
    }

    /// Dials a replacement channel for an existing session. The state must
    /// already be `Reconnecting`.
    async fn redial_locked(
        &self,
        shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(session_id) = shared.session_id.clone() else {
            return self.fail(shared, RelayError::Transport("resume without a session id".into()));
        };
        let acked = shared.queue.bytes_acked();
        drop(shared);

        let dialed = tokio::select! {
            dialed = self.endpoint.reconnect(&session_id, acked) => dialed,
            _ = cancel.cancelled() => {
                // State stays Reconnecting; the next read resumes the dial.
                return Err(RelayError::Cancelled);
            }
        };

        let mut shared = self.shared.lock().await;
        if shared.state == StreamState::Closed {
            return Err(RelayError::StreamClosed);
        }
        match dialed {
            Ok((tx, rx)) => {
                shared.epoch += 1;
                shared.reconnects += 1;
                shared.tx = Some(tx);
                shared.rx = Some(rx);
                debug!(reconnects = shared.reconnects, acked, "resume channel established");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "resume dial failed");
                self.fail(shared, e)
            }
        }
    }

    /// Re-sends the parked replay payloads in order, then transitions to
    /// `Connected` and wakes blocked writers.
    async fn drain_replay_locked(
        &self,
        mut shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if shared.state == StreamState::Closed {
                return Err(RelayError::StreamClosed);
            }
            let Some(payload) = shared.pending_replay.front().cloned() else {
                shared.state = StreamState::Connected;
                drop(shared);
                self.changed.notify_waiters();
                return Ok(());
            };
            let frame = match codec::encode_data(&payload) {
                Ok(frame) => frame,
                Err(e) => return self.fail(shared, e),
            };
            let Some(mut tx) = shared.tx.take() else {
                // An in-flight write still holds the send half.
                self.wait_changed(shared, cancel).await?;
                shared = self.shared.lock().await;
                continue;
            };
            let epoch = shared.epoch;
            drop(shared);

            let sent = {
                let send = tx.send(frame);
                tokio::pin!(send);
                tokio::select! {
                    sent = &mut send => Some(sent),
                    _ = cancel.cancelled() => None,
                }
            };

            shared = self.shared.lock().await;
            if shared.epoch == epoch {
                shared.tx = Some(tx);
            }
            let Some(sent) = sent else {
                // Remaining entries stay parked; the next read drains them.
                return Err(RelayError::Cancelled);
            };
            if shared.state == StreamState::Closed {
                return Err(RelayError::StreamClosed);
            }
            match sent {
                Ok(()) => {
                    shared.pending_replay.pop_front();
                }
                Err(e) => {
                    // The replacement channel died before replay finished.
                    return self.fail(shared, e);
                }
            }
        }
    }

    /// Waits for the next state change. The notification is armed before the
    /// guard is released so a wakeup cannot be missed.
    async fn wait_changed(
        &self,
        shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let notified = self.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(shared);
        tokio::select! {
            _ = &mut notified => Ok(()),
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// Marks the stream dead and propagates `err` to the caller. Later
    /// operations fail with `StreamClosed`.
    fn fail<T>(
        &self,
        mut shared: MutexGuard<'_, Shared<E::Tx, E::Rx>>,
        err: RelayError,
    ) -> Result<T> {
        warn!(error = %err, "relay stream failed");
        shared.state = StreamState::Closed;
        shared.tx = None;
        shared.rx = None;
        shared.pending_replay.clear();
        drop(shared);
        self.changed.notify_waiters();
        Err(err)
    }
}
