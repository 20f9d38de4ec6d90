use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::error::TickerClosed;

/// A tick handed to the subscriber.
///
/// The trigger stays blocked until [`Tick::done`] is called or the tick
/// is dropped.
#[derive(Debug)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    ack: oneshot::Sender<()>,
}

impl Tick {
    /// Signal that all work for this tick has finished
    pub fn done(self) {
        let _ = self.ack.send(());
    }
}

/// Producer side of the rendezvous
#[derive(Debug, Clone)]
pub struct TickTrigger {
    tx: mpsc::Sender<Tick>,
}

/// Subscriber side of the rendezvous
#[derive(Debug)]
pub struct Ticker {
    rx: mpsc::Receiver<Tick>,
}

/// Create a connected trigger/ticker pair
pub fn sync_ticker() -> (TickTrigger, Ticker) {
    let (tx, rx) = mpsc::channel(1);
    (TickTrigger { tx }, Ticker { rx })
}

impl TickTrigger {
    /// Deliver `timestamp` and wait until the subscriber finishes it
    pub async fn trigger(&self, timestamp: DateTime<Utc>) -> Result<(), TickerClosed> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Tick { timestamp, ack })
            .await
            .map_err(|_| TickerClosed)?;

        // A dropped tick means the subscriber shut down mid-tick.
        done.await.map_err(|_| TickerClosed)
    }
}

impl Ticker {
    /// Wait for the next tick; `None` once the trigger is gone
    pub async fn recv(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_blocks_until_done() {
        let (trigger, mut ticker) = sync_ticker();
        let finished = Arc::new(AtomicBool::new(false));
        let ts = Utc.timestamp_opt(1_700_000_060, 0).unwrap();

        let flag = finished.clone();
        let subscriber = tokio::spawn(async move {
            let tick = ticker.recv().await.unwrap();
            assert_eq!(tick.timestamp, ts);
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            tick.done();
        });

        trigger.trigger(ts).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
        subscriber.await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_fails_when_subscriber_gone() {
        let (trigger, ticker) = sync_ticker();
        drop(ticker);

        let ts = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        assert_eq!(trigger.trigger(ts).await, Err(TickerClosed));
    }

    #[tokio::test]
    async fn test_dropped_tick_releases_trigger() {
        let (trigger, mut ticker) = sync_ticker();
        tokio::spawn(async move {
            let tick = ticker.recv().await.unwrap();
            drop(tick);
        });

        let ts = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        assert_eq!(trigger.trigger(ts).await, Err(TickerClosed));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_trigger_dropped() {
        let (trigger, mut ticker) = sync_ticker();
        drop(trigger);
        assert!(ticker.recv().await.is_none());
    }
}
