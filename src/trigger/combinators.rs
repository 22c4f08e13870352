//! Stream combinators used to compose flows.

use std::future::Future;
use std::pin::Pin;

use async_stream::stream;
use futures::stream::{self, SelectAll};
use futures::{Stream, StreamExt};
use tracing::trace;

/// Interleave several streams; completes when all of them complete.
pub fn merge<S>(streams: impl IntoIterator<Item = S>) -> SelectAll<S>
where
    S: Stream + Unpin,
{
    stream::select_all(streams)
}

/// Emit the latest pair every time either side produces a value, once both
/// sides have produced at least one.
pub fn combine_latest<A, B>(left: A, right: B) -> impl Stream<Item = (A::Item, B::Item)>
where
    A: Stream,
    B: Stream,
    A::Item: Clone,
    B::Item: Clone,
{
    enum Side<L, R> {
        Left(Option<L>),
        Right(Option<R>),
        Closed,
    }

    stream! {
        let mut left = Box::pin(left);
        let mut right = Box::pin(right);
        let mut latest_left = None;
        let mut latest_right = None;
        let mut left_done = false;
        let mut right_done = false;

        loop {
            let side = tokio::select! {
                item = left.next(), if !left_done => Side::Left(item),
                item = right.next(), if !right_done => Side::Right(item),
                else => Side::Closed,
            };

            match side {
                Side::Left(Some(item)) => latest_left = Some(item),
                Side::Right(Some(item)) => latest_right = Some(item),
                Side::Left(None) => {
                    left_done = true;
                    // A side that never produced can never pair
                    if latest_left.is_none() {
                        break;
                    }
                    continue;
                }
                Side::Right(None) => {
                    right_done = true;
                    if latest_right.is_none() {
                        break;
                    }
                    continue;
                }
                Side::Closed => break,
            }

            if let (Some(l), Some(r)) = (&latest_left, &latest_right) {
                yield (l.clone(), r.clone());
            }
        }
    }
}

/// Map each item to a future, ignoring items that arrive while the previous
/// future is still running.
///
/// Dropped items are not queued. The output stream completes once the source
/// has completed and the in-flight future (if any) has resolved.
pub fn exhaust_map<S, F, Fut>(source: S, mut f: F) -> impl Stream<Item = Fut::Output>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future,
{
    enum Step<O, I> {
        Resolved(O),
        Arrived(Option<I>),
    }

    stream! {
        let mut source = Box::pin(source);
        let mut in_flight: Option<Pin<Box<Fut>>> = None;
        let mut source_done = false;

        loop {
            let Some(fut) = in_flight.as_mut() else {
                if source_done {
                    break;
                }
                match source.next().await {
                    Some(item) => in_flight = Some(Box::pin(f(item))),
                    None => break,
                }
                continue;
            };

            let step = tokio::select! {
                output = fut => Step::Resolved(output),
                item = source.next(), if !source_done => Step::Arrived(item),
            };

            match step {
                Step::Resolved(output) => {
                    in_flight = None;
                    yield output;
                }
                Step::Arrived(Some(_)) => trace!("Dropped item while a call is in flight"),
                Step::Arrived(None) => source_done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, mpsc};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test]
    async fn merge_interleaves_until_all_complete() {
        let a = stream::iter(vec![1, 3]);
        let b = stream::iter(vec![2]);
        let mut items: Vec<i32> = merge(vec![a.boxed(), b.boxed()]).collect().await;
        items.sort();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn combine_latest_waits_for_both_sides() {
        let (ltx, lrx) = mpsc::unbounded_channel();
        let (rtx, rrx) = mpsc::unbounded_channel();
        let combined = combine_latest(UnboundedReceiverStream::new(lrx), UnboundedReceiverStream::new(rrx));
        let mut combined = Box::pin(combined);

        ltx.send("auth-1").unwrap();
        rtx.send(vec!["us-east-1"]).unwrap();
        assert_eq!(combined.next().await, Some(("auth-1", vec!["us-east-1"])));

        ltx.send("auth-2").unwrap();
        assert_eq!(combined.next().await, Some(("auth-2", vec!["us-east-1"])));

        drop(ltx);
        drop(rtx);
        assert_eq!(combined.next().await, None);
    }

    #[tokio::test]
    async fn combine_latest_ends_when_a_silent_side_closes() {
        let (ltx, lrx) = mpsc::unbounded_channel::<u8>();
        let right = stream::pending::<u8>();
        let mut combined = Box::pin(combine_latest(UnboundedReceiverStream::new(lrx), right));
        drop(ltx);
        assert_eq!(combined.next().await, None);
    }

    #[tokio::test]
    async fn exhaust_map_drops_items_during_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let mapped = {
            let calls = calls.clone();
            let gate = gate.clone();
            exhaust_map(UnboundedReceiverStream::new(rx), move |n: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    n * 10
                }
            })
        };
        let mut mapped = Box::pin(mapped);

        for n in 1..=5 {
            tx.send(n).unwrap();
        }
        let first = tokio::spawn(async move {
            let out = mapped.next().await;
            (out, mapped)
        });

        // let the combinator drain the queued items while the first call waits
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();

        let (out, mut mapped) = first.await.unwrap();
        assert_eq!(out, Some(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tx.send(7).unwrap();
        gate.notify_one();
        assert_eq!(mapped.next().await, Some(70));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(tx);
        assert_eq!(mapped.next().await, None);
    }
}
