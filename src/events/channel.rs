//! Progress channel between a run and its renderer.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::Event;

/// Handle that stage workers, coordinators and the match engine publish through.
///
/// A detached sender (see [`null_sender`]) drops every event.
#[derive(Clone)]
pub struct EventSender {
    inner: Option<Sender<Event>>,
}

impl EventSender {
    /// Publish `event`. A run never blocks or fails on progress reporting.
    pub fn send(&self, event: Event) {
        if let Some(inner) = &self.inner {
            // Receiver gone means nobody is rendering
            let _ = inner.send(event);
        }
    }
}

/// Rendering side, drained by the CLI's progress thread
pub struct EventReceiver {
    inner: Receiver<Event>,
}

impl EventReceiver {
    /// Events in arrival order. Ends once every sender of the run is dropped.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter()
    }
}

pub struct EventChannel;

impl EventChannel {
    /// Unbounded so progress never applies backpressure to a stage queue.
    pub fn new() -> (EventSender, EventReceiver) {
        let (sender, receiver) = unbounded();
        (
            EventSender {
                inner: Some(sender),
            },
            EventReceiver { inner: receiver },
        )
    }
}

/// Sender for runs nobody is watching
pub fn null_sender() -> EventSender {
    EventSender { inner: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MatchEvent, MatchProgress, StageEvent, StageProgress};
    use std::thread;

    #[test]
    fn worker_progress_from_every_thread_is_delivered() {
        let (sender, receiver) = EventChannel::new();

        let workers: Vec<_> = (0..3)
            .map(|worker| {
                let sender = sender.clone();
                thread::spawn(move || {
                    sender.send(Event::Stage(StageEvent::Progress(StageProgress {
                        stage: "modifier".to_string(),
                        worker,
                        produced: 2,
                    })));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        drop(sender);

        let produced: u64 = receiver
            .iter()
            .map(|event| match event {
                Event::Stage(StageEvent::Progress(p)) => p.produced,
                other => panic!("unexpected event {other:?}"),
            })
            .sum();
        assert_eq!(produced, 6);
    }

    #[test]
    fn iteration_ends_when_the_run_drops_its_senders() {
        let (sender, receiver) = EventChannel::new();
        let renderer = thread::spawn(move || receiver.iter().count());

        sender.send(Event::Match(MatchEvent::Started));
        sender.send(Event::Match(MatchEvent::Completed(MatchProgress::default())));
        drop(sender);

        assert_eq!(renderer.join().unwrap(), 2);
    }

    #[test]
    fn detached_sender_discards_events() {
        let sender = null_sender();
        sender.send(Event::Stage(StageEvent::Drained {
            stage: "hasher".to_string(),
        }));
    }
}
