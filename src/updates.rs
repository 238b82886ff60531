//! Update queues between the stream receiver and the event dispatcher.
//!
//! The queues are unbounded so a slow dispatcher never stalls stream reads.
//! Instead the backlog is monitored: crossing the high-water mark logs a
//! warning, and the crossings and the deepest backlog seen are kept for
//! inspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Backlog {
    name: &'static str,
    high_water: usize,
    depth: AtomicUsize,
    peak: AtomicUsize,
    crossings: AtomicUsize,
}

pub fn channel<T>(name: &'static str, high_water: usize) -> (UpdateSender<T>, UpdateReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(Backlog {
        name,
        high_water,
        depth: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        crossings: AtomicUsize::new(0),
    });
    (
        UpdateSender {
            tx,
            backlog: Arc::clone(&backlog),
        },
        UpdateReceiver { rx, backlog },
    )
}

#[derive(Debug)]
pub struct UpdateSender<T> {
    tx: mpsc::UnboundedSender<T>,
    backlog: Arc<Backlog>,
}

impl<T> UpdateSender<T> {
    /// Queues `item` and reports whether this send pushed the backlog above
    /// the high-water mark.  Returns the item back if the receiver is gone.
    pub fn send(&self, item: T) -> Result<bool, T> {
        let depth = self.backlog.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(e) = self.tx.send(item) {
            self.backlog.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(e.0);
        }
        self.backlog.peak.fetch_max(depth, Ordering::AcqRel);
        let crossed = depth == self.backlog.high_water + 1;
        if crossed {
            self.backlog.crossings.fetch_add(1, Ordering::AcqRel);
            warn!(
                "{} queue backlog exceeds {} messages, dispatcher is lagging",
                self.backlog.name, self.backlog.high_water
            );
        }
        Ok(crossed)
    }
}

#[derive(Debug)]
pub struct UpdateReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    backlog: Arc<Backlog>,
}

impl<T> UpdateReceiver<T> {
    /// Next queued item, or `None` once every sender is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.backlog.depth.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    pub fn peak(&self) -> usize {
        self.backlog.peak.load(Ordering::Acquire)
    }

    /// Number of times the backlog rose above the high-water mark.
    pub fn crossings(&self) -> usize {
        self.backlog.crossings.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_blocks_past_high_water() {
        let (tx, mut rx) = channel("test", 2);
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        assert_eq!(rx.peak(), 10);
        for i in 0..10 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert_eq!(rx.peak(), 10);
    }

    #[tokio::test]
    async fn warns_once_per_high_water_crossing() {
        let (tx, mut rx) = channel("test", 2);
        let crossed: Vec<bool> = (0..5).map(|i| tx.send(i).unwrap()).collect();
        assert_eq!(crossed, vec![false, false, true, false, false]);
        assert_eq!(rx.crossings(), 1);

        // Drain below the mark, then climb past it again.
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        assert!(!tx.send(5).unwrap());
        assert!(tx.send(6).unwrap());
        assert!(!tx.send(7).unwrap());
        assert_eq!(rx.crossings(), 2);

        // Reaching the mark without exceeding it is not a crossing.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert!(!tx.send(8).unwrap());
        assert_eq!(rx.crossings(), 2);
    }

    #[tokio::test]
    async fn closes_when_sender_dropped() {
        let (tx, mut rx) = channel("test", 8);
        tx.send("last").unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn send_fails_without_receiver() {
        let (tx, rx) = channel::<u8>("test", 8);
        drop(rx);
        assert_eq!(tx.send(7), Err(7));
    }
}
