use std::collections::VecDeque;

use log::{trace, warn};
use resim_serde::{BitReader, BitWriter, Serde};

use super::{decode_input_batch, ControllerConfig, ControllerEvent, FrameInput, StatisticalRingBuffer};
use crate::{
    interface::{ControllerManager, NetworkInterface, RpcChannel},
    types::{InputId, PeerId, INPUT_ID_NONE},
};

/// Ordered queue of remotely produced input frames plus the frame currently
/// driving the simulation. Shared by the server and doll roles.
pub(crate) struct RemoteInputQueue {
    pub current_input_id: InputId,
    pub current_buffer: Vec<u8>,
    pub current_bit_size: u32,
    pub frames: VecDeque<FrameInput>,
    pub ghost_input_count: u32,
    /// Set when the sender announced an empty input stream; missing packets
    /// are then plain idling, not losses.
    pub streaming_paused: bool,
}

impl RemoteInputQueue {
    pub fn new() -> Self {
        Self {
            current_input_id: INPUT_ID_NONE,
            current_buffer: Vec::new(),
            current_bit_size: 0,
            frames: VecDeque::new(),
            ghost_input_count: 0,
            streaming_paused: false,
        }
    }

    /// Insert a received frame, keeping the queue ordered and dropping
    /// frames older than the simulation cursor. Returns `true` when the
    /// frame was actually queued.
    pub fn insert_frame(&mut self, frame: FrameInput) -> bool {
        if self.current_input_id != INPUT_ID_NONE && frame.id <= self.current_input_id {
            return false;
        }
        let position = self.frames.partition_point(|f| f.id < frame.id);
        if self.frames.get(position).map(|f| f.id) == Some(frame.id) {
            return false;
        }
        self.frames.insert(position, frame);
        true
    }

    /// Length of the gapless run of queued inputs starting at the next
    /// expected id.
    pub fn consecutive_inputs(&self) -> u32 {
        let mut expected = if self.current_input_id == INPUT_ID_NONE {
            match self.frames.front() {
                Some(front) => front.id,
                None => return 0,
            }
        } else {
            self.current_input_id.wrapping_add(1)
        };
        let mut count = 0;
        for frame in &self.frames {
            if frame.id == expected {
                count += 1;
                expected = expected.wrapping_add(1);
            } else if frame.id > expected {
                break;
            }
        }
        count
    }

    fn set_current(&mut self, frame: FrameInput) {
        self.current_input_id = frame.id;
        self.current_bit_size = frame.bit_size;
        self.current_buffer = frame.buffer;
    }

    /// Advance to the next in-order input. When the next frame is missing
    /// the previous one is reused as a ghost up to `max_ghosts` times, after
    /// which the queue either jumps to the oldest available frame or
    /// declares the stream paused.
    pub fn fetch_next_input(
        &mut self,
        max_ghosts: u32,
        events: &mut Vec<ControllerEvent>,
    ) -> bool {
        if self.current_input_id == INPUT_ID_NONE {
            // As the initial input, anything is good.
            if let Some(front) = self.frames.pop_front() {
                self.set_current(front);
                self.streaming_paused = false;
                return true;
            }
            return false;
        }

        if self.streaming_paused {
            if let Some(front) = self.frames.pop_front() {
                self.set_current(front);
                self.streaming_paused = false;
                self.ghost_input_count = 0;
                return true;
            }
            return false;
        }

        let next_id = self.current_input_id.wrapping_add(1);
        if self.frames.front().map(|f| f.id) == Some(next_id) {
            let front = self.frames.pop_front().expect("front checked above");
            self.set_current(front);
            self.ghost_input_count = 0;
            return true;
        }

        // The next input did not arrive in time.
        events.push(ControllerEvent::InputMissed(next_id));

        if self.ghost_input_count < max_ghosts {
            // Pretend the sender repeated its last input; reconciliation
            // repairs the guess if it was wrong.
            self.ghost_input_count += 1;
            self.current_input_id = next_id;
            trace!("Ghost input used for frame {next_id}.");
            return true;
        }

        self.ghost_input_count = 0;
        if let Some(front) = self.frames.pop_front() {
            // Ghost budget exhausted but later inputs exist: jump the gap.
            self.set_current(front);
            true
        } else {
            self.streaming_paused = true;
            false
        }
    }
}

/// The authoritative side of a remotely controlled object: queues client
/// inputs, watches connection health, and steers the client's tick rate.
pub struct ServerController {
    pub(crate) queue: RemoteInputQueue,
    pub(crate) peer_enabled: bool,
    network_watcher: StatisticalRingBuffer,
    consecutive_input_watcher: StatisticalRingBuffer,
    previous_frame_received_timestamp: u32,
    additional_fps_notif_timer: f64,
}

impl ServerController {
    pub fn new(traced_frames: usize) -> Self {
        Self {
            queue: RemoteInputQueue::new(),
            peer_enabled: false,
            network_watcher: StatisticalRingBuffer::new(traced_frames),
            consecutive_input_watcher: StatisticalRingBuffer::new(traced_frames),
            previous_frame_received_timestamp: u32::MAX,
            additional_fps_notif_timer: 0.0,
        }
    }

    pub fn current_input_id(&self) -> InputId {
        self.queue.current_input_id
    }

    pub fn inputs_count(&self) -> usize {
        self.queue.frames.len()
    }

    pub fn last_known_input(&self) -> InputId {
        self.queue
            .frames
            .back()
            .map(|f| f.id)
            .unwrap_or(INPUT_ID_NONE)
    }

    pub(crate) fn on_peer_update(&mut self, peer_enabled: bool) {
        if self.peer_enabled == peer_enabled {
            return;
        }
        self.peer_enabled = peer_enabled;
        self.queue.ghost_input_count = 0;
        if !peer_enabled {
            self.queue.frames.clear();
        }
    }

    /// A snapshot naming the current input id was just sent. An empty
    /// current input means the client announced a paused stream.
    pub(crate) fn notify_send_state(&mut self) {
        if self.queue.current_bit_size == 0 {
            self.queue.streaming_paused = true;
        }
    }

    pub(crate) fn receive_inputs(&mut self, data: &[u8], now_msec: u32) -> bool {
        let frames = match decode_input_batch(data) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("Dropping malformed input batch: {err}");
                return false;
            }
        };

        let newest_before = self.last_known_input();
        for (id, buffer, bit_size) in frames {
            self.queue.insert_frame(FrameInput {
                id,
                buffer,
                bit_size,
                similarity: id,
                received_timestamp: now_msec,
            });
        }

        let newest_after = self.last_known_input();
        let has_new_frames =
            newest_after != INPUT_ID_NONE && (newest_before == INPUT_ID_NONE || newest_after > newest_before);
        if has_new_frames {
            if self.previous_frame_received_timestamp != u32::MAX {
                let interval = now_msec.saturating_sub(self.previous_frame_received_timestamp);
                self.network_watcher.push(interval as f64);
            }
            self.previous_frame_received_timestamp = now_msec;
        }
        self.consecutive_input_watcher
            .push(self.queue.consecutive_inputs() as f64);

        true
    }

    pub(crate) fn process(
        &mut self,
        delta: f64,
        manager: &mut dyn ControllerManager,
        network: &mut dyn NetworkInterface,
        config: &ControllerConfig,
        peer: PeerId,
        events: &mut Vec<ControllerEvent>,
    ) {
        self.queue
            .fetch_next_input(config.max_redundant_inputs as u32, events);
        if self.queue.current_input_id == INPUT_ID_NONE {
            // Skip everything until the first input arrives.
            return;
        }

        let buffer = self.queue.current_buffer.clone();
        let mut reader = BitReader::new(&buffer);
        manager.controller_process(delta, &mut reader);

        self.adjust_player_tick_rate(delta, network, config, peer, events);
    }

    /// Keep the client's input buffer close to the optimal depth: when the
    /// connection is unstable the client is asked to produce inputs earlier,
    /// when the buffer grows past the need it is asked to slow down, trading
    /// artificial latency away.
    fn adjust_player_tick_rate(
        &mut self,
        delta: f64,
        network: &mut dyn NetworkInterface,
        config: &ControllerConfig,
        peer: PeerId,
        events: &mut Vec<ControllerEvent>,
    ) {
        self.additional_fps_notif_timer += delta * 1000.0;
        if self.additional_fps_notif_timer < config.tick_speedup_notification_delay as f64 {
            return;
        }
        self.additional_fps_notif_timer = 0.0;

        let frame_ms = (delta * 1000.0).max(1.0);
        let mean = self.network_watcher.average();
        let deviation = self.network_watcher.deviation(mean);
        let mut optimal_frame_delay = ((mean + deviation) / frame_ms).ceil() as i32;
        if self.consecutive_input_watcher.average() < 1.0 {
            // Inputs keep arriving with holes; buy one more frame of margin.
            optimal_frame_delay += 1;
        }
        let optimal_frame_delay =
            optimal_frame_delay.clamp(config.min_frames_delay, config.max_frames_delay);

        let current_frame_delay = self.inputs_count() as i32;
        let distance_to_optimal = optimal_frame_delay - current_frame_delay;
        let worst_receival_time_ms = self.network_watcher.max() as u32;

        let mut writer = BitWriter::new();
        (distance_to_optimal.clamp(i8::MIN as i32, i8::MAX as i32) as i8).ser(&mut writer);
        worst_receival_time_ms.ser(&mut writer);
        network.send(peer, RpcChannel::NotifyFpsAcceleration, writer.to_bytes());

        events.push(ControllerEvent::SpeedupAdjusted {
            worst_receival_time_ms,
            optimal_frame_delay,
            current_frame_delay,
            distance_to_optimal,
        });
    }
}

/// Server-side controller for an object the server both owns and simulates
/// (bots and the like). Input ingestion is a no-op and every tick produces a
/// fresh synthetic frame from the local collector.
pub struct AutonomousServerController {
    current_input_id: InputId,
}

impl AutonomousServerController {
    pub fn new() -> Self {
        Self {
            current_input_id: INPUT_ID_NONE,
        }
    }

    pub fn current_input_id(&self) -> InputId {
        self.current_input_id
    }

    pub(crate) fn receive_inputs(&mut self, _data: &[u8]) -> bool {
        warn!("The autonomous server controller does not expect to receive inputs.");
        false
    }

    pub(crate) fn process(&mut self, delta: f64, manager: &mut dyn ControllerManager) {
        let mut writer = BitWriter::new();
        manager.collect_inputs(delta, &mut writer);
        let buffer = writer.to_bytes();

        self.current_input_id = if self.current_input_id == INPUT_ID_NONE {
            0
        } else {
            self.current_input_id.wrapping_add(1)
        };

        let mut reader = BitReader::new(&buffer);
        manager.controller_process(delta, &mut reader);
    }
}

impl Default for AutonomousServerController {
    fn default() -> Self {
        Self::new()
    }
}
