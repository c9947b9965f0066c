use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::domain::PriceSnapshot;

/// Identifies one subscription for `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) symbol: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

/// Publisher side of a subscription, held by the cache
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::Sender<Arc<PriceSnapshot>>,
    pub(crate) dropped: Arc<AtomicU64>,
}

/// Snapshots for one symbol, in publish order.
///
/// Ends (`recv` returns `None`) once the subscription is removed from the
/// cache and buffered snapshots are drained.
pub struct MarketDataStream {
    rx: mpsc::Receiver<Arc<PriceSnapshot>>,
    dropped: Arc<AtomicU64>,
}

impl MarketDataStream {
    pub(crate) fn channel(id: u64, buffer: usize) -> (Subscriber, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Subscriber {
                id,
                tx,
                dropped: Arc::clone(&dropped),
            },
            Self { rx, dropped },
        )
    }

    pub async fn recv(&mut self) -> Option<Arc<PriceSnapshot>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<PriceSnapshot>> {
        self.rx.try_recv().ok()
    }

    /// Updates discarded because this subscriber's buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for MarketDataStream {
    type Item = Arc<PriceSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
