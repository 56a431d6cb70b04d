use std::{cell::RefCell, rc::Rc};

use crate::types::ProcessHandler;

/// The ordered phases a tick is split into. Callbacks registered under an
/// earlier phase always run before callbacks of a later one; within a phase
/// the dispatch order is (object sorted order, registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessPhase {
    Early,
    PreProcess,
    Process,
    PostProcess,
    Late,
}

impl ProcessPhase {
    pub const COUNT: usize = 5;

    pub const ALL: [ProcessPhase; Self::COUNT] = [
        ProcessPhase::Early,
        ProcessPhase::PreProcess,
        ProcessPhase::Process,
        ProcessPhase::PostProcess,
        ProcessPhase::Late,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

pub(crate) type ProcessFunc = Rc<RefCell<dyn FnMut(f64)>>;

/// An ordered list of per-tick callbacks with stable unbind handles.
#[derive(Default)]
pub(crate) struct Processor {
    entries: Vec<(ProcessHandler, ProcessFunc)>,
    next_handler: u32,
}

impl Processor {
    pub fn bind(&mut self, func: ProcessFunc) -> ProcessHandler {
        let handler = ProcessHandler(self.next_handler);
        self.next_handler += 1;
        self.entries.push((handler, func));
        handler
    }

    pub fn unbind(&mut self, handler: ProcessHandler) {
        self.entries.retain(|(h, _)| *h != handler);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn funcs(&self) -> impl Iterator<Item = &ProcessFunc> {
        self.entries.iter().map(|(_, f)| f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_order_is_preserved_and_unbind_is_stable() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut processor = Processor::default();

        let l1 = log.clone();
        let _h1 = processor.bind(Rc::new(RefCell::new(move |_| l1.borrow_mut().push(1))));
        let l2 = log.clone();
        let h2 = processor.bind(Rc::new(RefCell::new(move |_| l2.borrow_mut().push(2))));
        let l3 = log.clone();
        let _h3 = processor.bind(Rc::new(RefCell::new(move |_| l3.borrow_mut().push(3))));

        for func in processor.funcs().cloned().collect::<Vec<_>>() {
            (&mut *func.borrow_mut())(0.016);
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);

        log.borrow_mut().clear();
        processor.unbind(h2);
        for func in processor.funcs().cloned().collect::<Vec<_>>() {
            (&mut *func.borrow_mut())(0.016);
        }
        assert_eq!(*log.borrow(), vec![1, 3]);
    }
}
