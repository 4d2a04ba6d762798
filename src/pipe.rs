//! The pipe engine: streams one source to every paired receiver.
//!
//! This runs once per established rendezvous, as its own spawned task. It
//! owns the sender's request body and every receiver's response body for the
//! entire transfer and is the only code that ever moves transfer bytes —
//! the registry has already stepped out of the way by the time this runs.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use http_body::Frame;
use tracing::{info, warn};

use crate::body::{destroyed, BodyWriter};
use crate::multipart::Source;
use crate::registry::{PathRegistry, PendingRendezvous, SourceHeaders};

/// Per-participant channel capacity for the actual data fan-out.
///
/// Small on purpose: the whole point is that a slow receiver's bounded
/// channel fills up and makes the fan-out loop wait, which in turn leaves
/// the sender's own socket buffer the only place bytes pile up.
const DATA_CHANNEL_CAPACITY: usize = 4;

pub(crate) const fn data_channel_capacity() -> usize {
    DATA_CHANNEL_CAPACITY
}

/// Drives one established rendezvous from start to finish, then frees the
/// path in `registry` for reuse.
pub(crate) async fn run(registry: Arc<PathRegistry>, path: String, pending: PendingRendezvous) {
    let PendingRendezvous {
        n_receivers,
        sender,
        receivers,
    } = pending;
    let sender = sender.expect("pipe engine only runs on a complete rendezvous");

    let _ = sender.info_tx.try_send(Ok(Frame::data(Bytes::from(
        format!("[INFO] Start sending with {n_receivers} receiver(s)!\n"),
    ))));

    let (mut source, headers) = match select_source(sender.body, &sender.headers, sender.is_multipart).await {
        Ok(pair) => pair,
        Err(message) => {
            warn!(path = %path, error = %message, "failed to read sender's body");
            let _ = sender
                .info_tx
                .try_send(Ok(Frame::data(Bytes::from("[ERROR] Sending failed.\n"))));
            fail_receivers(receivers);
            registry.clear_established(&path);
            return;
        }
    };

    // Wake every receiver's handler with the headers to use, handing over
    // the sending half of its data channel for the fan-out loop below.
    let mut data_txs: Vec<BodyWriter> = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let _ = receiver.established_tx.send(headers.clone());
        data_txs.push(receiver.data_tx);
    }

    loop {
        match source.next_chunk().await {
            None => {
                info!(path = %path, "transfer complete");
                let _ = sender.info_tx.try_send(Ok(Frame::data(Bytes::from(
                    "[INFO] Sending successful!\n",
                ))));
                break;
            }
            Some(Err(err)) if err.is_disconnect() => {
                // The sender's own connection went away mid-stream: there is
                // no one left to read an `[ERROR]` line, so skip it and tear
                // every receiver down instead of letting them end cleanly.
                warn!(path = %path, "sender disconnected mid-transfer");
                destroy_all(data_txs).await;
                registry.clear_established(&path);
                return;
            }
            Some(Err(_)) => {
                warn!(path = %path, "source read failed mid-transfer");
                let _ = sender
                    .info_tx
                    .try_send(Ok(Frame::data(Bytes::from("[ERROR] Sending failed.\n"))));
                break;
            }
            Some(Ok(bytes)) => {
                let sent = join_all(data_txs.iter().map(|tx| {
                    let frame = Frame::data(bytes.clone());
                    async move { tx.send(Ok(frame)).await.is_ok() }
                }))
                .await;

                for i in (0..data_txs.len()).rev() {
                    if !sent[i] {
                        data_txs.remove(i);
                    }
                }

                if data_txs.is_empty() {
                    info!(path = %path, "all receivers closed halfway");
                    let _ = sender
                        .info_tx
                        .send(Ok(Frame::data(Bytes::from(
                            "[INFO] All receiver(s) was/were closed halfway.\n",
                        ))))
                        .await;
                    let _ = sender.info_tx.send(Err(destroyed())).await;
                    registry.clear_established(&path);
                    return;
                }
            }
        }
    }

    registry.clear_established(&path);
}

async fn select_source(
    body: hyper::body::Incoming,
    headers: &SourceHeaders,
    is_multipart: bool,
) -> Result<(Source, SourceHeaders), String> {
    if is_multipart {
        let content_type = headers
            .content_type
            .clone()
            .ok_or_else(|| "multipart body declared without a Content-Type".to_string())?;
        Source::multipart(body, &content_type)
            .await
            .map_err(|err| err.to_string())
    } else {
        Ok((Source::raw(body), headers.clone()))
    }
}

fn fail_receivers(receivers: Vec<crate::registry::ReceiverSlot>) {
    for receiver in receivers {
        let _ = receiver.established_tx.send(SourceHeaders::default());
    }
}

/// Forcibly tears down every still-open receiver, for the "sender
/// disconnected" termination event: a plain channel close would let each
/// receiver's response end cleanly, but the spec calls for destroying them.
async fn destroy_all(data_txs: Vec<BodyWriter>) {
    for tx in data_txs {
        let _ = tx.send(Err(destroyed())).await;
    }
}
