//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound how long a streamed body may sit without producing a frame
//! - Cancel the exchange cleanly when it does
//!
//! Connect, response-head and handshake deadlines are plain
//! `tokio::time::timeout` calls at their use sites; this module holds the
//! pieces that need their own type.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::BoxError;
use hyper::body::{Body, Frame, SizeHint};
use thiserror::Error;
use tokio::time::{Instant, Sleep};

/// A streamed body stalled for longer than the idle limit.
#[derive(Debug, Error)]
#[error("body idle for more than {0:?}")]
pub struct IdleTimeout(pub Duration);

/// Wraps a body and fails it if no frame arrives within `idle`.
///
/// The clock runs only while the body is waiting on its producer: it starts
/// at the first `Pending` after a frame, so time the consumer spends not
/// polling never counts against the stream.
#[derive(Debug)]
pub struct IdleTimeoutBody<B> {
    inner: B,
    idle: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl<B> IdleTimeoutBody<B> {
    pub fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: None,
            armed: false,
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.armed = false;
                Poll::Ready(frame.map(|result| result.map_err(Into::into)))
            }
            Poll::Pending => {
                let idle = this.idle;
                let next = Instant::now() + idle;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(next)));
                if !this.armed {
                    deadline.as_mut().reset(next);
                    this.armed = true;
                }
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        let err: BoxError = Box::new(IdleTimeout(idle));
                        Poll::Ready(Some(Err(err)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::convert::Infallible;

    #[tokio::test]
    async fn passes_complete_body_through() {
        let body = IdleTimeoutBody::new(Full::new(Bytes::from_static(b"ok")), Duration::from_secs(1));
        assert_eq!(body.size_hint().exact(), Some(2));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out() {
        let frames = stream::pending::<Result<Frame<Bytes>, Infallible>>();
        let body = IdleTimeoutBody::new(StreamBody::new(frames), Duration::from_secs(5));

        let err = body.collect().await.unwrap_err();
        assert!(err.downcast_ref::<IdleTimeout>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_stream_is_not_cut_off() {
        let frames = stream::unfold(0u8, |n| async move {
            if n == 4 {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
            Some((Ok::<_, Infallible>(Frame::data(Bytes::from(vec![n]))), n + 1))
        });
        let body = IdleTimeoutBody::new(StreamBody::new(Box::pin(frames)), Duration::from_secs(5));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(&[0, 1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_does_not_count_as_idle() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(1);
        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
        });
        let mut body = IdleTimeoutBody::new(StreamBody::new(Box::pin(frames)), Duration::from_secs(5));

        tx.send(Bytes::from_static(b"first")).await.unwrap();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "first");

        // Consumer stalls well past the idle limit before asking again.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(Bytes::from_static(b"second")).await.unwrap();
        });
        let second = body.frame().await.unwrap().unwrap();
        assert_eq!(second.into_data().unwrap(), "second");
        producer.await.unwrap();
    }
}
