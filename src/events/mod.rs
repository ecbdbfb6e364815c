//! # Events Module
//!
//! Progress reporting for benchmark runs.
//!
//! ## Design
//! Pipeline workers, stage coordinators and the match engine emit events
//! through a channel; the CLI subscribes and renders progress bars.
//! Dropping the receiver turns every send into a no-op.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         if let Event::Match(MatchEvent::Progress(p)) = event {
//!             println!("{} matches", p.persisted);
//!         }
//!     }
//! });
//!
//! pipeline.run_with_events(&sender)?;
//! ```

mod channel;
mod types;

pub use channel::{null_sender, EventChannel, EventReceiver, EventSender};
pub use types::*;
