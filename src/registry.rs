//! The path registry: the process-wide map from path to rendezvous state.
//!
//! This module owns exactly the state described as the "Path Registry" and
//! "Establishment Logic" components of the system: it decides whether an
//! incoming sender or receiver can join a path, tracks who is waiting where,
//! and promotes a path to "established" the moment it is complete. It does
//! not stream any bytes itself — once a path promotes, the registry hands the
//! established participants to [`crate::pipe`] and gets out of the way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::HeaderValue;
use hyper::body::Incoming;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::body::BodyWriter;
use crate::err::RegistrationError;
use crate::pipe;

/// Header candidates carried alongside a byte stream: forwarded to receivers
/// as-is, with absent values simply omitted rather than sent empty.
#[derive(Debug, Clone, Default)]
pub struct SourceHeaders {
    /// `Content-Length` of the chosen source, if known up front.
    pub content_length: Option<HeaderValue>,
    /// `Content-Type` of the chosen source.
    pub content_type: Option<HeaderValue>,
    /// `Content-Disposition` of the chosen source.
    pub content_disposition: Option<HeaderValue>,
}

/// Everything the registry needs to hold about a registered sender while its
/// rendezvous is still pending.
pub(crate) struct SenderSlot {
    /// Channel for `[INFO]`/`[ERROR]` lines written to the sender's own
    /// response for the lifetime of the exchange.
    pub(crate) info_tx: BodyWriter,
    /// The sender's raw request body. Left completely unread until
    /// promotion — this is what keeps the "no buffering beyond in-flight
    /// transport" guarantee: the client's own TCP stack holds the data.
    pub(crate) body: Incoming,
    /// Header candidates taken from the outer request, used verbatim unless
    /// the body turns out to be `multipart/form-data`.
    pub(crate) headers: SourceHeaders,
    /// Whether the sender's `Content-Type` indicated a multipart body.
    pub(crate) is_multipart: bool,
    watcher: AbortHandle,
}

/// Everything the registry needs to hold about a registered receiver while
/// its rendezvous is still pending.
pub(crate) struct ReceiverSlot {
    /// Stable identity for this receiver within its `PendingRendezvous`,
    /// assigned once at registration. Never reused — this is what lets a
    /// withdrawal find the right slot even after an earlier receiver's
    /// withdrawal has shifted everyone else's `Vec` position.
    id: u64,
    /// Where the pipe engine will push this receiver's share of the fanned-
    /// out source stream, once established.
    pub(crate) data_tx: BodyWriter,
    /// Wakes the receiver's HTTP handler once headers are known, so it can
    /// finally return its `Response` to `hyper`.
    pub(crate) established_tx: oneshot::Sender<SourceHeaders>,
    watcher: AbortHandle,
}

/// A rendezvous that has not yet completed: the sender and/or some prefix of
/// the declared receivers have arrived, but not both in full.
pub(crate) struct PendingRendezvous {
    pub(crate) n_receivers: u32,
    pub(crate) sender: Option<SenderSlot>,
    pub(crate) receivers: Vec<ReceiverSlot>,
    /// Counter handing out the next [`ReceiverSlot::id`]. Monotonic for the
    /// lifetime of this pending rendezvous; never reused, so a watcher task
    /// spawned for a since-withdrawn receiver can never be mistaken for a
    /// receiver that registered later and happened to land on the same `Vec`
    /// position.
    next_receiver_id: u64,
}

impl PendingRendezvous {
    fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receivers.is_empty()
    }

    fn is_complete(&self) -> bool {
        self.sender.is_some() && self.receivers.len() as u32 == self.n_receivers
    }
}

/// What a path in the registry currently holds.
enum Slot {
    Pending(PendingRendezvous),
    /// A transfer is in progress; the registry only remembers that the path
    /// is taken, the actual participants now live with the pipe engine.
    Established,
}

/// The process-wide path registry.
///
/// All mutations go through a single mutex. Registry operations never do
/// more than touch the map and hand off already-built channels/tasks, so the
/// lock is never held across an `.await` point or a blocking I/O call —
/// matching the spec's note that a single global lock is fine given how
/// cheap these operations are relative to the streaming they gate.
pub struct PathRegistry {
    paths: Mutex<HashMap<String, Slot>>,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a sender on `path`, declaring `n` receivers.
    ///
    /// On success, an initial waiting line has already been pushed onto
    /// `info_tx`, and a background task has been armed to withdraw this
    /// sender if `abort_rx` fires before promotion.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_sender(
        self: &Arc<Self>,
        path: String,
        n: i64,
        info_tx: BodyWriter,
        body: Incoming,
        headers: SourceHeaders,
        is_multipart: bool,
        abort_rx: oneshot::Receiver<()>,
    ) -> Result<(), RegistrationError> {
        if n <= 0 {
            return Err(RegistrationError::NotPositive);
        }
        let n = n as u32;

        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        match paths.get_mut(&path) {
            Some(Slot::Established) => {
                return Err(RegistrationError::AlreadyEstablished { path });
            }
            Some(Slot::Pending(pending)) => {
                if pending.sender.is_some() {
                    return Err(RegistrationError::SenderAlreadyRegistered { path });
                }
                if pending.n_receivers != n {
                    return Err(RegistrationError::ReceiverCountMismatch {
                        expected: pending.n_receivers,
                        offered: n,
                    });
                }

                let already_connected = pending.receivers.len();
                let _ = info_tx.try_send(Ok(http_body::Frame::data(
                    waiting_line(n, already_connected),
                )));

                let watcher = self.spawn_abort_watcher(path.clone(), abort_rx, Role::Sender);
                pending.sender = Some(SenderSlot {
                    info_tx,
                    body,
                    headers,
                    is_multipart,
                    watcher,
                });

                let complete = pending.is_complete();
                drop(paths);
                if complete {
                    self.promote(path);
                }
                Ok(())
            }
            None => {
                let _ = info_tx.try_send(Ok(http_body::Frame::data(waiting_line(n, 0))));
                let watcher = self.spawn_abort_watcher(path.clone(), abort_rx, Role::Sender);
                paths.insert(
                    path,
                    Slot::Pending(PendingRendezvous {
                        n_receivers: n,
                        sender: Some(SenderSlot {
                            info_tx,
                            body,
                            headers,
                            is_multipart,
                            watcher,
                        }),
                        receivers: Vec::new(),
                        next_receiver_id: 0,
                    }),
                );
                Ok(())
            }
        }
    }

    /// Registers a receiver on `path`, declaring `n` receivers.
    ///
    /// On success returns a one-shot that resolves with the headers to use
    /// once this path's rendezvous is established (which may happen
    /// immediately, if this receiver happened to be the missing piece).
    pub(crate) fn register_receiver(
        self: &Arc<Self>,
        path: String,
        n: i64,
        data_tx: BodyWriter,
        abort_rx: oneshot::Receiver<()>,
    ) -> Result<oneshot::Receiver<SourceHeaders>, RegistrationError> {
        if n <= 0 {
            return Err(RegistrationError::NotPositive);
        }
        let n = n as u32;

        let (established_tx, established_rx) = oneshot::channel();

        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        match paths.get_mut(&path) {
            Some(Slot::Established) => {
                return Err(RegistrationError::AlreadyEstablished { path });
            }
            Some(Slot::Pending(pending)) => {
                if pending.n_receivers != n {
                    return Err(RegistrationError::ReceiverCountMismatch {
                        expected: pending.n_receivers,
                        offered: n,
                    });
                }
                if pending.receivers.len() as u32 >= pending.n_receivers {
                    return Err(RegistrationError::ReceiverLimitReached { path, limit: n });
                }

                if let Some(sender) = &pending.sender {
                    let _ = sender
                        .info_tx
                        .try_send(Ok(http_body::Frame::data(RECEIVER_CONNECTED_LINE.into())));
                }

                let id = pending.next_receiver_id;
                pending.next_receiver_id += 1;
                let watcher = self.spawn_abort_watcher(path.clone(), abort_rx, Role::Receiver(id));
                pending.receivers.push(ReceiverSlot {
                    id,
                    data_tx,
                    established_tx,
                    watcher,
                });

                let complete = pending.is_complete();
                drop(paths);
                if complete {
                    self.promote(path);
                }
                Ok(established_rx)
            }
            None => {
                let id = 0;
                let watcher = self.spawn_abort_watcher(path.clone(), abort_rx, Role::Receiver(id));
                paths.insert(
                    path,
                    Slot::Pending(PendingRendezvous {
                        n_receivers: n,
                        sender: None,
                        receivers: vec![ReceiverSlot {
                            id,
                            data_tx,
                            established_tx,
                            watcher,
                        }],
                        next_receiver_id: id + 1,
                    }),
                );
                Ok(established_rx)
            }
        }
    }

    /// Clears the established marker for `path`, making it available again.
    ///
    /// Called by the pipe engine exactly once, when a transfer terminates
    /// for any reason.
    pub(crate) fn clear_established(&self, path: &str) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.remove(path);
    }

    /// Attempts promotion for `path`, assuming the caller already dropped the
    /// registry lock (promotion spawns the pipe engine, which must not run
    /// while the lock is held).
    fn promote(self: &Arc<Self>, path: String) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        let Some(Slot::Pending(pending)) = paths.get(&path) else {
            // Someone else already promoted (or the path vanished); nothing
            // to do. Can't happen under the current single-lock design, but
            // guarding against it costs nothing.
            return;
        };
        if !pending.is_complete() {
            return;
        }
        let Some(Slot::Pending(pending)) = paths.insert(path.clone(), Slot::Established) else {
            unreachable!("checked above");
        };
        drop(paths);

        // This is the linearisation point: every participant's abort
        // handler is disarmed by aborting its watcher task before the pipe
        // engine — which may itself terminate the rendezvous — ever runs.
        if let Some(sender) = &pending.sender {
            sender.watcher.abort();
        }
        for receiver in &pending.receivers {
            receiver.watcher.abort();
        }

        debug!(path = %path, receivers = pending.receivers.len(), "rendezvous established");
        let registry = Arc::clone(self);
        tokio::spawn(pipe::run(registry, path, pending));
    }

    /// Removes `participant` from the pending rendezvous at `path`, if it is
    /// still there. A no-op if the path was already promoted or the
    /// participant was already removed — matching the spec's requirement
    /// that withdrawal is idempotent with respect to promotion races.
    fn withdraw(&self, path: &str, role: Role) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        let remove_path = match paths.get_mut(path) {
            Some(Slot::Pending(pending)) => {
                match role {
                    Role::Sender => {
                        pending.sender = None;
                    }
                    Role::Receiver(id) => {
                        // Looked up by stable id, not `Vec` position: an
                        // earlier receiver's withdrawal may already have
                        // shifted every later receiver's index, and a
                        // position captured at registration time would then
                        // point at the wrong (possibly still-connected)
                        // receiver.
                        if let Some(pos) = pending.receivers.iter().position(|r| r.id == id) {
                            pending.receivers.remove(pos);
                        }
                    }
                }
                pending.is_empty()
            }
            _ => false,
        };
        if remove_path {
            paths.remove(path);
            trace!(path, "pending rendezvous emptied by withdrawal");
        }
    }

    /// Spawns the background task that withdraws a participant if its
    /// disconnect guard fires before promotion disarms it.
    fn spawn_abort_watcher(
        self: &Arc<Self>,
        path: String,
        abort_rx: oneshot::Receiver<()>,
        role: Role,
    ) -> AbortHandle {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if abort_rx.await.is_ok() {
                warn!(path = %path, role = ?role, "participant disconnected before establishment");
                registry.withdraw(&path, role);
            }
        });
        handle.abort_handle()
    }
}

/// Which participant a watcher task is tracking.
///
/// A receiver carries its stable [`ReceiverSlot::id`] rather than a `Vec`
/// position: an earlier receiver's withdrawal shifts everyone after it in
/// `PendingRendezvous::receivers`, so a position captured once at
/// registration time would go stale the moment a sibling disconnects.
#[derive(Debug, Clone, Copy)]
enum Role {
    Sender,
    Receiver(u64),
}

const RECEIVER_CONNECTED_LINE: &str = "[INFO] A receiver was connected.\n";

fn waiting_line(n: u32, already_connected: usize) -> bytes::Bytes {
    bytes::Bytes::from(format!(
        "[INFO] Waiting for {n} receiver(s) ({already_connected} already connected)...\n"
    ))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::body::channel;

    /// A receiver registration's channels, split out so a test can trigger
    /// its withdrawal (`abort_tx.send(())`) independently of reading
    /// anything from `data_tx`.
    fn receiver_channel() -> (BodyWriter, oneshot::Sender<()>, oneshot::Receiver<()>) {
        let (data_tx, _data_body) = channel(1);
        let (abort_tx, abort_rx) = oneshot::channel();
        (data_tx, abort_tx, abort_rx)
    }

    /// Regression test for a stale-`Vec`-index bug: withdrawing a receiver
    /// that is not last in `PendingRendezvous::receivers` must not evict a
    /// later, still-connected receiver that happens to have slid into the
    /// withdrawn one's old position.
    #[tokio::test]
    async fn withdrawing_a_non_last_receiver_does_not_evict_a_survivor() {
        let registry = Arc::new(PathRegistry::new());
        let path = "/p".to_string();

        let (data_tx1, abort_tx1, abort_rx1) = receiver_channel();
        let (data_tx2, abort_tx2, abort_rx2) = receiver_channel();
        registry
            .register_receiver(path.clone(), 2, data_tx1, abort_rx1)
            .expect("first receiver registers");
        registry
            .register_receiver(path.clone(), 2, data_tx2, abort_rx2)
            .expect("second receiver registers");

        // Withdraw the receiver at Vec position 0, so the second receiver
        // slides down to position 0.
        abort_tx1.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (data_tx3, _abort_tx3, abort_rx3) = receiver_channel();
        let established3 = registry
            .register_receiver(path.clone(), 2, data_tx3, abort_rx3)
            .expect("third receiver takes the freed slot");

        // Withdraw the second receiver next. Its watcher was armed with the
        // Vec position it held *at registration time* (1); with a
        // position-keyed withdrawal this would incorrectly remove the third
        // receiver, which now sits at position 1, instead.
        abort_tx2.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The third receiver must still be genuinely pending: nothing should
        // have dropped its `established_tx` out from under it.
        assert!(matches!(
            established3.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    /// A withdrawn-then-refilled path must end up with exactly the set of
    /// receivers that are still actually connected: registering a fourth
    /// receiver after the mixup above must still respect the declared
    /// receiver limit of 2 (one survivor plus the new arrival), not silently
    /// have lost track of who is really present.
    #[tokio::test]
    async fn receiver_count_stays_accurate_after_interleaved_withdrawals() {
        let registry = Arc::new(PathRegistry::new());
        let path = "/r".to_string();

        let (data_tx1, abort_tx1, abort_rx1) = receiver_channel();
        let (data_tx2, _abort_tx2, abort_rx2) = receiver_channel();
        registry
            .register_receiver(path.clone(), 2, data_tx1, abort_rx1)
            .expect("first receiver registers");
        registry
            .register_receiver(path.clone(), 2, data_tx2, abort_rx2)
            .expect("second receiver registers");

        abort_tx1.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (data_tx3, _abort_tx3, abort_rx3) = receiver_channel();
        registry
            .register_receiver(path.clone(), 2, data_tx3, abort_rx3)
            .expect("third receiver takes the freed slot");

        let (data_tx4, _abort_tx4, abort_rx4) = receiver_channel();
        let err = registry
            .register_receiver(path.clone(), 2, data_tx4, abort_rx4)
            .expect_err("the path already holds its declared 2 receivers");
        assert!(matches!(err, RegistrationError::ReceiverLimitReached { .. }));
    }
}
