mod doll;
mod input_batch;
mod no_net;
mod player;
mod server;
mod watcher;

pub use doll::DollController;
pub use input_batch::{decode_input_batch, encode_input_batch, FrameInput};
pub use no_net::NoNetController;
pub use player::PlayerController;
pub use server::{AutonomousServerController, ServerController};
pub use watcher::StatisticalRingBuffer;

use crate::{
    interface::{ControllerManager, NetworkInterface},
    types::{InputId, PeerId, INPUT_ID_NONE},
};

/// Tunables shared by every controller role.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cap on inputs buffered by the player while waiting for server acks.
    /// At 60 ticks per second the default keeps the player at most three
    /// seconds ahead of the server.
    pub player_input_storage_size: usize,
    /// How many of the latest frames each unreliable input packet carries.
    pub max_redundant_inputs: usize,
    /// Milliseconds between tick-rate adjustments sent to the client.
    pub tick_speedup_notification_delay: u32,
    /// Sample count of the connection-health ring buffers.
    pub network_traced_frames: usize,
    /// Bounds of the optimal input-buffer depth maintained by the server.
    pub min_frames_delay: i32,
    pub max_frames_delay: i32,
    /// Peak additional frames per second a client may be asked to produce.
    pub tick_acceleration: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            player_input_storage_size: 180,
            max_redundant_inputs: 6,
            tick_speedup_notification_delay: 600,
            network_traced_frames: 120,
            min_frames_delay: 2,
            max_frames_delay: 7,
            tick_acceleration: 5.0,
        }
    }
}

/// Events surfaced by controller processing, drained and broadcast by the
/// owning synchronizer after the scene step.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// The server had to reuse or skip inputs for this controller.
    InputMissed(InputId),
    /// A tick-rate adjustment was emitted (server) or applied (client).
    SpeedupAdjusted {
        worst_receival_time_ms: u32,
        optimal_frame_delay: i32,
        current_frame_delay: i32,
        distance_to_optimal: i32,
    },
}

/// The role-specific state machine of a controller.
pub enum ControllerRole {
    Null,
    NoNet(NoNetController),
    Player(PlayerController),
    Server(ServerController),
    AutonomousServer(AutonomousServerController),
    Doll(DollController),
}

/// A controller attached to exactly one object and commanded by exactly one
/// peer. The role variant is replaced, not mutated, when the authority
/// layout changes.
pub struct NetController {
    pub(crate) manager: Box<dyn ControllerManager>,
    pub config: ControllerConfig,
    pub(crate) server_controlled: bool,
    /// Peer with authority over the controlled object.
    pub(crate) peer: PeerId,
    pub(crate) role: ControllerRole,
}

impl NetController {
    pub(crate) fn new(
        manager: Box<dyn ControllerManager>,
        config: ControllerConfig,
        server_controlled: bool,
        peer: PeerId,
    ) -> Self {
        Self {
            manager,
            config,
            server_controlled,
            peer,
            role: ControllerRole::Null,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn server_controlled(&self) -> bool {
        self.server_controlled
    }

    pub fn is_player_controller(&self) -> bool {
        matches!(self.role, ControllerRole::Player(_))
    }

    pub fn is_doll_controller(&self) -> bool {
        matches!(self.role, ControllerRole::Doll(_))
    }

    pub fn is_server_controller(&self) -> bool {
        matches!(
            self.role,
            ControllerRole::Server(_) | ControllerRole::AutonomousServer(_)
        )
    }

    pub fn current_input_id(&self) -> InputId {
        match &self.role {
            ControllerRole::Null => INPUT_ID_NONE,
            ControllerRole::NoNet(c) => c.current_input_id(),
            ControllerRole::Player(c) => c.current_input_id(),
            ControllerRole::Server(c) => c.current_input_id(),
            ControllerRole::AutonomousServer(c) => c.current_input_id(),
            ControllerRole::Doll(c) => c.current_input_id(),
        }
    }

    /// Step the controller for one (sub-)tick. During a rewind only queued
    /// instants are replayed; roles without one idle. Returns `true` when a
    /// new input frame was produced by a local player.
    pub(crate) fn process(
        &mut self,
        delta: f64,
        network: &mut dyn NetworkInterface,
        events: &mut Vec<ControllerEvent>,
        rewinding: bool,
    ) -> bool {
        let Self {
            manager,
            config,
            peer,
            role,
            ..
        } = self;
        match role {
            ControllerRole::Null => false,
            ControllerRole::NoNet(c) => {
                c.process(delta, manager.as_mut());
                false
            }
            ControllerRole::Player(c) => {
                c.process(delta, manager.as_mut(), network, config, rewinding)
            }
            ControllerRole::Server(c) => {
                c.process(delta, manager.as_mut(), network, config, *peer, events);
                false
            }
            ControllerRole::AutonomousServer(c) => {
                c.process(delta, manager.as_mut());
                false
            }
            ControllerRole::Doll(c) => {
                c.process(delta, manager.as_mut(), events, rewinding);
                false
            }
        }
    }

    /// Ingest a packed input batch from the network. Returns `false` when
    /// this role does not accept inputs.
    pub(crate) fn receive_inputs(&mut self, data: &[u8], now_msec: u32) -> bool {
        match &mut self.role {
            ControllerRole::Server(c) => c.receive_inputs(data, now_msec),
            ControllerRole::AutonomousServer(c) => c.receive_inputs(data),
            ControllerRole::Doll(c) => c.receive_inputs(data, now_msec),
            _ => {
                log::warn!("This controller role does not accept remote inputs.");
                false
            }
        }
    }

    /// The server acknowledged every input up to and including `input_id`.
    pub(crate) fn notify_input_checked(&mut self, input_id: InputId) {
        match &mut self.role {
            ControllerRole::Player(c) => c.notify_input_checked(input_id),
            ControllerRole::Doll(c) => c.notify_input_checked(input_id),
            _ => {}
        }
    }

    /// Position the controller on a stored input for instant reprocessing
    /// during a rewind.
    pub(crate) fn queue_instant_process(&mut self, input_id: InputId, index: usize, count: usize) {
        match &mut self.role {
            ControllerRole::Player(c) => c.queue_instant_process(input_id, index, count),
            ControllerRole::Doll(c) => c.queue_instant_process(input_id, index, count),
            _ => {}
        }
    }

    pub(crate) fn player(&self) -> Option<&PlayerController> {
        match &self.role {
            ControllerRole::Player(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn player_mut(&mut self) -> Option<&mut PlayerController> {
        match &mut self.role {
            ControllerRole::Player(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn server(&mut self) -> Option<&mut ServerController> {
        match &mut self.role {
            ControllerRole::Server(c) => Some(c),
            _ => None,
        }
    }
}
