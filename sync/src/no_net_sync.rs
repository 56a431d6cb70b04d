use crate::{
    event::NetEventFlag,
    interface::{NetworkInterface, SynchronizerManager},
    scene::{ChangeSink, SceneData},
    synchronizer::SyncEvents,
};

/// The offline role: the tick workflow stays identical, the network goes
/// away. A frame counter stands in for the input id stream.
pub(crate) struct NoNetSynchronizer {
    pub enabled: bool,
    pub frame_count: u32,
}

impl NoNetSynchronizer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            frame_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.enabled = true;
        self.frame_count = 0;
    }

    pub fn process(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        _events: &mut SyncEvents,
    ) {
        if !self.enabled {
            return;
        }
        self.frame_count += 1;
        log::trace!("NoNetSynchronizer frame {}", self.frame_count);

        let delta = scene.tick_delta();
        scene.process_functions_execute(network, delta, false);
        scene.detect_changes(manager, network, NetEventFlag::CHANGE, &mut ChangeSink::None);
        scene.controller_events.clear();
    }

    pub fn set_enabled(&mut self, enabled: bool, events: &mut SyncEvents) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            events.emit_sync_started();
        } else {
            events.emit_sync_paused();
        }
    }
}
