use log::warn;
use resim_serde::BitReader;

use super::{decode_input_batch, server::RemoteInputQueue, ControllerEvent, FrameInput};
use crate::{
    interface::ControllerManager,
    types::{InputId, INPUT_ID_NONE},
};

/// Client-side remote-controlled object. Ingests relayed inputs exactly like
/// the server side and simulates them in order; corrections come through
/// world snapshots, never from an own prediction loop.
pub struct DollController {
    queue: RemoteInputQueue,
    queued_instant_to_process: Option<usize>,
    max_ghosts: u32,
}

impl DollController {
    pub fn new(max_ghosts: u32) -> Self {
        Self {
            queue: RemoteInputQueue::new(),
            queued_instant_to_process: None,
            max_ghosts,
        }
    }

    pub fn current_input_id(&self) -> InputId {
        self.queue.current_input_id
    }

    pub(crate) fn receive_inputs(&mut self, data: &[u8], now_msec: u32) -> bool {
        let frames = match decode_input_batch(data) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("Doll dropping malformed input batch: {err}");
                return false;
            }
        };
        for (id, buffer, bit_size) in frames {
            self.queue.insert_frame(FrameInput {
                id,
                buffer,
                bit_size,
                similarity: id,
                received_timestamp: now_msec,
            });
        }
        true
    }

    /// Position the read cursor on a queued input for instant reprocessing
    /// during the player's rewind.
    pub fn queue_instant_process(&mut self, input_id: InputId, _index: usize, _count: usize) {
        match self.queue.frames.iter().position(|f| f.id == input_id) {
            Some(position) => self.queued_instant_to_process = Some(position),
            None => {
                // The relayed input never arrived; the snapshot correction
                // will cover this frame instead.
                self.queued_instant_to_process = None;
            }
        }
    }

    /// Drop every queued input the reconciliation has validated.
    pub fn notify_input_checked(&mut self, checked_input_id: InputId) {
        while let Some(front) = self.queue.frames.front() {
            if front.id <= checked_input_id {
                self.queue.frames.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn process(
        &mut self,
        delta: f64,
        manager: &mut dyn ControllerManager,
        events: &mut Vec<ControllerEvent>,
        rewinding: bool,
    ) {
        if let Some(index) = self.queued_instant_to_process.take() {
            let Some(frame) = self.queue.frames.get(index) else {
                return;
            };
            let buffer = frame.buffer.clone();
            let mut reader = BitReader::new(&buffer);
            manager.controller_process(delta, &mut reader);
            return;
        }

        if rewinding {
            // The relayed input for this rewound frame never arrived; the
            // snapshot correction covers it instead.
            return;
        }

        self.queue.fetch_next_input(self.max_ghosts, events);
        if self.queue.current_input_id == INPUT_ID_NONE {
            return;
        }
        let buffer = self.queue.current_buffer.clone();
        let mut reader = BitReader::new(&buffer);
        manager.controller_process(delta, &mut reader);
    }
}
