//! A response [`Body`] backed by an async channel, plus the disconnect
//! tracking that rides along with it.
//!
//! Every participant's response (sender or receiver) is a long-lived stream
//! whose content is produced by code running elsewhere (the establishment
//! logic, the pipe engine) rather than computed up front. [`ChannelBody`] is
//! the plumbing that lets `hyper` poll for the next chunk while some other
//! task pushes chunks into it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};
use tokio::sync::{mpsc, oneshot};

/// The sending half of a [`ChannelBody`].
///
/// Cloning is not supported: each body has exactly one writer, matching the
/// one-source-per-participant shape of the rendezvous protocol. Writers
/// observe backpressure because the channel is bounded; a slow reader
/// (receiver) makes its writer (the pipe engine's fan-out loop) wait before
/// sending the next chunk.
///
/// The error side isn't `Infallible`: the pipe engine uses it to forcibly
/// tear down a connection (spec's "destroy" termination events) by pushing
/// an `Err` frame instead of just closing the channel, which `hyper`
/// surfaces as a mid-stream connection failure rather than a clean end.
pub(crate) type BodyWriter = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

/// The error a forcibly-destroyed participant connection is torn down with.
pub(crate) fn destroyed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "rendezvous peer destroyed")
}

/// Creates a connected writer/body pair with the given channel capacity.
///
/// `capacity` bounds how many chunks may be in flight for this one
/// participant before its writer has to wait — the "independent buffered
/// sink" referred to by the pipe engine's fan-out contract.
pub(crate) fn channel(capacity: usize) -> (BodyWriter, ChannelBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ChannelBody { rx, _guard: None })
}

/// As [`channel`], but the returned body also arms a disconnect guard: when
/// the body is dropped (because `hyper` tore down the connection, for any
/// reason), `on_disconnect` fires exactly once.
pub(crate) fn channel_with_disconnect(
    capacity: usize,
) -> (BodyWriter, ChannelBody, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (guard, guard_rx) = disconnect_signal();
    (
        tx,
        ChannelBody {
            rx,
            _guard: Some(guard),
        },
        guard_rx,
    )
}

/// Arms a standalone disconnect guard, for a participant whose response has
/// not been handed to `hyper` yet (a receiver waiting on establishment).
///
/// Holding the returned guard as a local variable across an `.await` works
/// because `hyper` drops an in-flight service future when it tears down the
/// connection driving it — which drops the guard along with every other
/// local in that future's frame, firing the paired receiver.
pub(crate) fn disconnect_signal() -> (DisconnectGuard, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (DisconnectGuard(Some(tx)), rx)
}

/// Fires a one-shot channel when dropped.
///
/// This is how a pending participant's on-abort handler is "armed": the
/// handler is just a task awaiting the paired [`oneshot::Receiver`]. Dropping
/// the guard (which happens when the connection ends, cleanly or otherwise)
/// fires it. "Disarming" happens one level up, by cancelling the task that
/// would otherwise act on the signal — the guard itself is never silenced.
pub(crate) struct DisconnectGuard(Option<oneshot::Sender<()>>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            // The receiving end may already be gone if the watcher task was
            // cancelled (disarmed at promotion); that is not an error.
            let _ = tx.send(());
        }
    }
}

/// A [`Body`] whose frames arrive from elsewhere via an async channel.
pub(crate) struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, io::Error>>,
    _guard: Option<DisconnectGuard>,
}

impl ChannelBody {
    /// An already-closed body, for responses that have no content to stream
    /// (reserved-path replies, CORS preflight, error bodies of zero length).
    pub(crate) fn empty() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self { rx, _guard: None }
    }

    /// A body that yields exactly one text frame and then ends.
    pub(crate) fn once(text: impl Into<Bytes>) -> Self {
        let (tx, mut body) = channel(1);
        let frame = Frame::data(text.into());
        // The channel has capacity 1 so this never blocks.
        let _ = tx.try_send(Ok(frame));
        drop(tx);
        body.rx.close();
        body
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }
}
