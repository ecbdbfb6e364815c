//! Bounded inter-stage queues with an explicit end-of-stream marker.

use super::CancellationToken;
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use std::time::Duration;

/// How often a blocked queue operation re-checks the cancellation token
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What travels through a stage queue
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem<T> {
    Record(T),
    /// No more records from one producer. Each consumer takes exactly one.
    EndOfStream,
}

/// The run was cancelled, or the other side of the queue is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Create a bounded queue whose blocking operations honor `cancel`
pub fn stage_queue<T>(capacity: usize, cancel: &CancellationToken) -> (Outbox<T>, Inbox<T>) {
    let (sender, receiver) = bounded(capacity.max(1));
    (
        Outbox {
            sender,
            cancel: cancel.clone(),
        },
        Inbox {
            receiver,
            cancel: cancel.clone(),
        },
    )
}

/// Producing end of a stage queue
pub struct Outbox<T> {
    sender: Sender<QueueItem<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Outbox<T> {
    /// Enqueue without blocking. A full queue hands the item back.
    pub fn offer(&self, item: QueueItem<T>) -> Result<Option<QueueItem<T>>, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted);
        }
        match self.sender.try_send(item) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(item)) => Ok(Some(item)),
            Err(TrySendError::Disconnected(_)) => Err(Interrupted),
        }
    }

    /// Enqueue, blocking while the queue is full
    pub fn send(&self, mut item: QueueItem<T>) -> Result<(), Interrupted> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupted);
            }
            match self.sender.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Interrupted),
            }
        }
    }

    /// Send one `EndOfStream` per consumer
    pub fn close(&self, consumers: usize) -> Result<(), Interrupted> {
        for _ in 0..consumers {
            self.send(QueueItem::EndOfStream)?;
        }
        Ok(())
    }
}

/// Consuming end of a stage queue
pub struct Inbox<T> {
    receiver: Receiver<QueueItem<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Inbox<T> {
    /// Dequeue without blocking; `None` when the queue is empty
    pub fn poll(&self) -> Result<Option<QueueItem<T>>, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted);
        }
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Interrupted),
        }
    }

    /// Dequeue, blocking while the queue is empty
    pub fn recv(&self) -> Result<QueueItem<T>, Interrupted> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupted);
            }
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(item) => return Ok(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Interrupted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn full_queue_hands_item_back() {
        let token = CancellationToken::new();
        let (outbox, _inbox) = stage_queue::<u32>(1, &token);

        assert_eq!(outbox.offer(QueueItem::Record(1)), Ok(None));
        assert_eq!(
            outbox.offer(QueueItem::Record(2)),
            Ok(Some(QueueItem::Record(2)))
        );
    }

    #[test]
    fn close_sends_one_marker_per_consumer() {
        let token = CancellationToken::new();
        let (outbox, inbox) = stage_queue::<u32>(4, &token);

        outbox.send(QueueItem::Record(7)).unwrap();
        outbox.close(3).unwrap();

        assert_eq!(inbox.recv(), Ok(QueueItem::Record(7)));
        for _ in 0..3 {
            assert_eq!(inbox.recv(), Ok(QueueItem::EndOfStream));
        }
        assert_eq!(inbox.poll(), Ok(None));
    }

    #[test]
    fn cancel_unblocks_a_waiting_consumer() {
        let token = CancellationToken::new();
        let (_outbox, inbox) = stage_queue::<u32>(1, &token);

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert_eq!(inbox.recv(), Err(Interrupted));
        handle.join().unwrap();
    }

    #[test]
    fn cancel_unblocks_a_waiting_producer() {
        let token = CancellationToken::new();
        let (outbox, _inbox) = stage_queue::<u32>(1, &token);
        outbox.send(QueueItem::Record(1)).unwrap();

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert_eq!(outbox.send(QueueItem::Record(2)), Err(Interrupted));
        handle.join().unwrap();
    }

    #[test]
    fn dropped_consumers_interrupt_the_producer() {
        let token = CancellationToken::new();
        let (outbox, inbox) = stage_queue::<u32>(1, &token);
        drop(inbox);

        assert_eq!(outbox.send(QueueItem::Record(1)), Err(Interrupted));
    }
}
