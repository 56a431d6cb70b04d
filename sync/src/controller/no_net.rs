use resim_serde::{BitReader, BitWriter};

use crate::{interface::ControllerManager, types::InputId};

/// Controller used when the game instance is not a peer of any kind: the
/// input workflow stays identical, only the network goes away.
pub struct NoNetController {
    frame_id: InputId,
}

impl NoNetController {
    pub fn new() -> Self {
        Self { frame_id: 0 }
    }

    pub fn current_input_id(&self) -> InputId {
        self.frame_id
    }

    pub(crate) fn process(&mut self, delta: f64, manager: &mut dyn ControllerManager) {
        let mut writer = BitWriter::new();
        manager.collect_inputs(delta, &mut writer);
        let buffer = writer.to_bytes();

        let mut reader = BitReader::new(&buffer);
        manager.controller_process(delta, &mut reader);

        self.frame_id = self.frame_id.wrapping_add(1);
    }
}

impl Default for NoNetController {
    fn default() -> Self {
        Self::new()
    }
}
