//! Regroups an arbitrary byte stream into fixed-size chunks
//!
//! Network bodies arrive in whatever pieces the transport produces. The
//! pipeline wants uniform chunks, so pieces are buffered until a full chunk
//! is available; the final chunk may be shorter. At most one chunk plus one
//! transport piece is held in memory.

use std::fmt::Display;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{Result, StageError};

enum Phase {
    Reading,
    Drained,
    Failed,
}

struct State<S> {
    inner: S,
    buf: BytesMut,
    chunk_size: usize,
    read_timeout: Duration,
    phase: Phase,
}

/// Rechunk `inner` into `chunk_size` pieces, failing if no data arrives
/// within `read_timeout`.
///
/// Errors from `inner` end the stream after being yielded once.
pub fn fixed_chunks<S, E>(
    inner: S,
    chunk_size: usize,
    read_timeout: Duration,
) -> BoxStream<'static, Result<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = State {
        inner,
        buf: BytesMut::with_capacity(chunk_size),
        chunk_size: chunk_size.max(1),
        read_timeout,
        phase: Phase::Reading,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            match st.phase {
                Phase::Failed => return None,
                Phase::Drained => {
                    if st.buf.is_empty() {
                        return None;
                    }
                    let last = st.buf.split().freeze();
                    return Some((Ok(last), st));
                }
                Phase::Reading => {}
            }

            if st.buf.len() >= st.chunk_size {
                let chunk = st.buf.split_to(st.chunk_size).freeze();
                return Some((Ok(chunk), st));
            }

            match tokio::time::timeout(st.read_timeout, st.inner.next()).await {
                Ok(Some(Ok(piece))) => st.buf.extend_from_slice(&piece),
                Ok(Some(Err(e))) => {
                    st.phase = Phase::Failed;
                    st.buf.clear();
                    let err = StageError::FetchFailed(format!("Stream interrupted: {e}"));
                    return Some((Err(err), st));
                }
                Ok(None) => st.phase = Phase::Drained,
                Err(_) => {
                    st.phase = Phase::Failed;
                    st.buf.clear();
                    let err = StageError::FetchFailed(format!(
                        "No data received for {:?}",
                        st.read_timeout
                    ));
                    return Some((Err(err), st));
                }
            }
        }
    })
    .boxed()
}
