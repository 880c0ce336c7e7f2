use std::collections::VecDeque;

/// FIFO of pending compile requests.
///
/// Requests are pushed when a key crosses its hotness threshold and drained by the owning
/// interpreter at an instruction boundary, so translation never runs in the middle of an
/// instruction. Until a request is serviced the key simply keeps being interpreted.
#[derive(Debug)]
pub struct CompileQueue<T> {
    pending: VecDeque<T>,
}

impl<T> Default for CompileQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<T> CompileQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: T) {
        self.pending.push_back(request);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
