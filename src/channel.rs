//! Channel front-end
//!
//! Feeds a circle from a channel instead of a create callback. Rank 0 reads
//! the input channel until it is closed; every rank sends the items it
//! dequeues to the output channel.
//!
//! ```text
//!   host ──input──► rank 0 create ──► local queues ──steal──► ranks
//!                                                               │
//!   host ◄──output──────────────── process (dequeue, forward) ◄─┘
//! ```

use crate::config::CreatePolicy;
use crate::engine::worker::panic_message;
use crate::engine::{Circle, Control, Handle, RunReport, WorkItem};
use crate::error::{CircleError, Result, WorkerError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::warn;

/// A running circle driven through channels
pub struct ChannelQueue {
    /// Items to distribute; drop it to end the create step
    pub input: Sender<Vec<u8>>,

    /// Items as they are dequeued by the ranks
    pub output: Receiver<WorkItem>,

    /// Control handle of the running circle
    control: Control,

    /// Thread running the circle
    handle: JoinHandle<Result<RunReport>>,
}

impl ChannelQueue {
    /// Control handle of the running circle
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Close the input and wait for the run to finish
    pub fn finish(self) -> Result<RunReport> {
        drop(self.input);
        self.handle.join().map_err(|payload| {
            CircleError::from(WorkerError::Panicked {
                rank: 0,
                message: panic_message(payload.as_ref()),
            })
        })?
    }
}

/// Start `circle` in the background with channel-backed callbacks
///
/// Any callbacks already registered are replaced, and only rank 0 reads
/// the input channel.
pub fn channel_begin(mut circle: Circle) -> Result<ChannelQueue> {
    let (input, input_rx) = unbounded::<Vec<u8>>();
    let (output_tx, output) = unbounded::<WorkItem>();

    circle.config_mut().create = CreatePolicy::Coordinator;
    circle.on_create(move |h: &mut dyn Handle| {
        for bytes in input_rx.iter() {
            if !h.enqueue(&bytes) {
                warn!(len = bytes.len(), "Channel item rejected");
            }
        }
    });
    circle.on_process(move |h: &mut dyn Handle| {
        if let Some(item) = h.dequeue() {
            // A closed output just means the host stopped listening
            let _ = output_tx.send(item);
        }
    });

    let control = circle.control();
    let handle = thread::Builder::new()
        .name("circle-channel".into())
        .spawn(move || circle.run())
        .map_err(|e| WorkerError::SpawnFailed {
            rank: 0,
            reason: e.to_string(),
        })?;

    Ok(ChannelQueue {
        input,
        output,
        control,
        handle,
    })
}
