//! Bounded buffering of response bodies that must still reach the client intact.

use axum::body::{Body, Bytes};
use futures_util::{StreamExt, stream};

pub(crate) enum Captured {
    Complete(Bytes),
    /// Everything read so far followed by the unread remainder.
    Passthrough(Body),
}

/// Reads `body` frame by frame, stopping as soon as it exceeds `limit`.
/// Nothing is dropped either way: an overflowing or failing body is handed
/// back with the bytes already read in front of it.
pub(crate) async fn collect_limited(body: Body, limit: usize) -> Captured {
    let mut frames = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut len = 0usize;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(chunk) => {
                len += chunk.len();
                chunks.push(chunk);
                if len > limit {
                    let head = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return Captured::Passthrough(Body::from_stream(head.chain(frames)));
                }
            }
            Err(e) => {
                tracing::warn!("Body failed mid-stream, forwarding as read: {}", e);
                let head = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err::<Bytes, _>(e)));
                return Captured::Passthrough(Body::from_stream(stream::iter(head)));
            }
        }
    }

    let mut buf = Vec::with_capacity(len);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Captured::Complete(Bytes::from(buf))
}
