use std::collections::VecDeque;

use log::warn;
use resim_serde::{BitReader, BitWriter};

use super::{encode_input_batch, ControllerConfig, FrameInput};
use crate::{
    interface::{ControllerManager, NetworkInterface, RpcChannel},
    types::{InputId, INPUT_ID_NONE},
};

/// Local authority over an object on a client peer: collects inputs,
/// predicts the simulation, and ships redundant input batches upstream.
pub struct PlayerController {
    current_input_id: InputId,
    input_buffers_counter: InputId,
    time_bank: f64,
    /// Additional frames per second requested by the server's tick-rate
    /// feedback. Positive values make this client produce inputs earlier.
    pub(crate) acceleration_fps_speed: f64,
    frames: VecDeque<FrameInput>,
    queued_instant_to_process: Option<usize>,
}

impl PlayerController {
    pub fn new() -> Self {
        Self {
            current_input_id: INPUT_ID_NONE,
            input_buffers_counter: 0,
            time_bank: 0.0,
            acceleration_fps_speed: 0.0,
            frames: VecDeque::new(),
            queued_instant_to_process: None,
        }
    }

    pub fn current_input_id(&self) -> InputId {
        self.current_input_id
    }

    pub fn frames_input_count(&self) -> usize {
        self.frames.len()
    }

    pub fn last_known_input(&self) -> InputId {
        self.frames.back().map(|f| f.id).unwrap_or(INPUT_ID_NONE)
    }

    pub fn stored_input_id(&self, index: usize) -> InputId {
        self.frames.get(index).map(|f| f.id).unwrap_or(INPUT_ID_NONE)
    }

    /// The pretended frame duration: the real tick length compressed or
    /// stretched by the server-requested acceleration.
    pub fn pretended_delta(&self, ticks_per_second: f64) -> f64 {
        1.0 / (ticks_per_second + self.acceleration_fps_speed)
    }

    /// How many sub-ticks to run this frame, from the accumulated time bank.
    pub fn calculates_sub_ticks(&mut self, delta: f64, ticks_per_second: f64) -> u32 {
        let pretended_delta = self.pretended_delta(ticks_per_second);
        self.time_bank += delta;
        let sub_ticks = (self.time_bank / pretended_delta).floor() as u32;
        self.time_bank -= sub_ticks as f64 * pretended_delta;
        sub_ticks
    }

    pub fn can_accept_new_inputs(&self, config: &ControllerConfig) -> bool {
        self.frames.len() < config.player_input_storage_size
    }

    /// One sub-tick: collect a new input frame (or replay a queued one
    /// during a rewind), advance the simulation, ship the redundancy window.
    /// Returns `true` when a new input frame was produced.
    pub(crate) fn process(
        &mut self,
        delta: f64,
        manager: &mut dyn ControllerManager,
        network: &mut dyn NetworkInterface,
        config: &ControllerConfig,
        rewinding: bool,
    ) -> bool {
        if let Some(index) = self.queued_instant_to_process.take() {
            let Some(frame) = self.frames.get(index) else {
                warn!("Queued rewind instant {index} is out of the stored input range.");
                return false;
            };
            self.current_input_id = frame.id;
            let buffer = frame.buffer.clone();
            let mut reader = BitReader::new(&buffer);
            manager.controller_process(delta, &mut reader);
            return false;
        }

        if rewinding {
            // A rewind step without a queued instant; nothing to replay.
            return false;
        }

        if !self.can_accept_new_inputs(config) {
            warn!(
                "The player input buffer is full ({} frames); input collection \
                 is stalled until the server acknowledges some.",
                self.frames.len()
            );
            return false;
        }

        let mut writer = BitWriter::new();
        manager.collect_inputs(delta, &mut writer);
        let bit_size = writer.bits_written();
        let buffer = writer.to_bytes();

        let id = self.input_buffers_counter;
        self.input_buffers_counter += 1;
        self.current_input_id = id;

        let similarity = match self.frames.back() {
            Some(previous) => {
                let mut a = BitReader::new(&previous.buffer);
                let mut b = BitReader::new(&buffer);
                if previous.bit_size == bit_size && !manager.are_inputs_different(&mut a, &mut b) {
                    previous.similarity
                } else {
                    id
                }
            }
            None => id,
        };

        self.frames.push_back(FrameInput {
            id,
            buffer: buffer.clone(),
            bit_size,
            similarity,
            received_timestamp: 0,
        });

        let mut reader = BitReader::new(&buffer);
        manager.controller_process(delta, &mut reader);

        self.send_frame_input_buffer_to_server(network, config);
        true
    }

    /// Ship the newest `min(buffered, max_redundant_inputs)` frames in one
    /// unreliable packet. Lost packets are healed by the next send.
    fn send_frame_input_buffer_to_server(
        &mut self,
        network: &mut dyn NetworkInterface,
        config: &ControllerConfig,
    ) {
        let count = self.frames.len().min(config.max_redundant_inputs.max(1));
        let start = self.frames.len() - count;
        let window: Vec<FrameInput> = self.frames.iter().skip(start).cloned().collect();
        let payload = encode_input_batch(&window);
        network.send(network.server_peer_id(), RpcChannel::ReceiveInput, payload);
    }

    /// Drop every stored frame the server has acknowledged.
    pub fn notify_input_checked(&mut self, checked_input_id: InputId) {
        while let Some(front) = self.frames.front() {
            if front.id <= checked_input_id {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn queue_instant_process(&mut self, input_id: InputId, index: usize, _count: usize) {
        match self.frames.get(index) {
            Some(frame) if frame.id == input_id => {
                self.queued_instant_to_process = Some(index);
            }
            _ => {
                warn!(
                    "Cannot queue input {input_id} at index {index}: the stored \
                     frame does not match."
                );
            }
        }
    }

    pub(crate) fn apply_fps_acceleration(
        &mut self,
        distance_to_optimal: i32,
        tick_acceleration: f64,
    ) {
        self.acceleration_fps_speed =
            (distance_to_optimal as f64).clamp(-tick_acceleration, tick_acceleration);
    }
}

impl Default for PlayerController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_ticks_follow_the_time_bank() {
        let mut player = PlayerController::new();
        // Exactly one tick of time at 60 tps.
        assert_eq!(player.calculates_sub_ticks(1.0 / 60.0, 60.0), 1);
        // A long hitch produces several sub ticks.
        assert_eq!(player.calculates_sub_ticks(3.0 / 60.0, 60.0), 3);
        // Nothing accumulated, nothing to run.
        assert_eq!(player.calculates_sub_ticks(0.0, 60.0), 0);
    }

    #[test]
    fn acceleration_shrinks_the_pretended_delta() {
        let mut player = PlayerController::new();
        let base = player.pretended_delta(60.0);
        player.apply_fps_acceleration(3, 5.0);
        assert!(player.pretended_delta(60.0) < base);
        // The correction is clamped to the configured peak.
        player.apply_fps_acceleration(100, 5.0);
        assert_eq!(player.acceleration_fps_speed, 5.0);
    }

    #[test]
    fn ack_drops_stored_frames_up_to_the_checked_id() {
        let mut player = PlayerController::new();
        for id in 0..5 {
            player.frames.push_back(FrameInput {
                id,
                buffer: Vec::new(),
                bit_size: 0,
                similarity: id,
                received_timestamp: 0,
            });
        }
        player.notify_input_checked(2);
        assert_eq!(player.frames_input_count(), 2);
        assert_eq!(player.stored_input_id(0), 3);
    }
}
