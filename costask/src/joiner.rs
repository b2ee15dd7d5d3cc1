//! Chains an ordered sequence of byte streams into one continuous stream.
//!
//! The streams are produced on demand by a callback: stream N+1 is not requested (and so, for
//! lazy range readers, no request is made for it) until stream N has ended.
use crate::Result;
use bytes::Bytes;
use futures::{stream::FusedStream, Stream};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tracing::trace;

use crate::objstore::ByteStream;

/// Produce a stream that yields every chunk of every stream returned by `next_stream`, in order.
///
/// `next_stream` is called with the current cursor and returns either the next stream along with
/// the cursor to use on the following call, or `None` once there are no more streams.  The cursor
/// is opaque to the joiner.  Nothing happens until the returned stream is first polled.
///
/// If a sub-stream yields an error, that error is yielded and the joined stream then ends without
/// requesting any further sub-streams.
pub fn join_streams<C, F>(cursor: C, next_stream: F) -> JoinedStream<C, F>
where
    F: FnMut(C) -> Option<(ByteStream, C)>,
{
    JoinedStream {
        state: JoinState::AwaitingNext(cursor),
        next_stream,
        streams_opened: 0,
    }
}

enum JoinState<C> {
    /// Between sub-streams; the next one hasn't been requested yet
    AwaitingNext(C),

    /// Passing through the chunks of the current sub-stream
    Piping(ByteStream, C),

    /// The callback reported there are no more sub-streams
    Done,

    /// A sub-stream failed and the error was already yielded
    Errored,
}

/// The stream returned by [`join_streams`]
pub struct JoinedStream<C, F> {
    state: JoinState<C>,
    next_stream: F,
    streams_opened: usize,
}

impl<C, F> JoinedStream<C, F> {
    /// How many sub-streams have been requested from the callback so far
    pub fn streams_opened(&self) -> usize {
        self.streams_opened
    }
}

impl<C, F> Stream for JoinedStream<C, F>
where
    C: Unpin,
    F: FnMut(C) -> Option<(ByteStream, C)> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match std::mem::replace(&mut this.state, JoinState::Done) {
                JoinState::AwaitingNext(cursor) => match (this.next_stream)(cursor) {
                    Some((stream, cursor)) => {
                        this.streams_opened += 1;
                        trace!(
                            streams_opened = this.streams_opened,
                            "Piping next sub-stream"
                        );
                        this.state = JoinState::Piping(stream, cursor);
                    }
                    None => {
                        trace!(streams_opened = this.streams_opened, "All sub-streams consumed");
                        return Poll::Ready(None);
                    }
                },
                JoinState::Piping(mut stream, cursor) => match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        this.state = JoinState::Piping(stream, cursor);
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.state = JoinState::Errored;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        this.state = JoinState::AwaitingNext(cursor);
                    }
                    Poll::Pending => {
                        this.state = JoinState::Piping(stream, cursor);
                        return Poll::Pending;
                    }
                },
                state @ (JoinState::Done | JoinState::Errored) => {
                    this.state = state;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<C, F> FusedStream for JoinedStream<C, F>
where
    C: Unpin,
    F: FnMut(C) -> Option<(ByteStream, C)> + Unpin,
{
    fn is_terminated(&self) -> bool {
        matches!(self.state, JoinState::Done | JoinState::Errored)
    }
}
