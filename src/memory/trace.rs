use std::cell::Cell;
use std::fmt;

/// Wraps every heap allocation with the collector's mark bit. The bit lives
/// in a `Cell` so marking can happen through shared references while the
/// object graph is being traversed.
#[derive(Debug)]
pub struct Traced<T: ?Sized> {
    marked: Cell<bool>,
    pub(super) data: T,
}

impl<T> Traced<T> {
    /// Creates a new `Traced` with the mark bit cleared (white).
    pub(super) fn new(data: T) -> Self {
        Self {
            marked: Cell::new(false),
            data,
        }
    }
}

impl<T: ?Sized> Traced<T> {
    pub(super) fn mark(&self) {
        self.marked.set(true);
    }

    pub(super) fn unmark(&self) {
        self.marked.set(false);
    }

    pub(super) fn marked(&self) -> bool {
        self.marked.get()
    }
}

impl<T: fmt::Display> fmt::Display for Traced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Traced [marked={}] {}", self.marked.get(), &self.data)
    }
}
