use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use colored::*;

use super::trace::Traced;
use crate::debug::LOG_OBJECT;

/// Handle to a heap object owned by the garbage collector.
///
/// The pointee is a `Traced<T>` boxed inside the collector, so the pointer
/// stays valid while the object is reachable from the roots. The VM runs on
/// a single thread and every window in which a collection can happen keeps
/// its objects rooted, which is what makes handing out plain pointers sound.
pub struct Gc<T: ?Sized> {
    ptr: NonNull<Traced<T>>,
}

impl<T: fmt::Debug> Gc<T> {
    /// Wraps a collector-owned allocation. Only the collector creates these.
    pub(super) fn new(ptr: &mut Traced<T>) -> Self {
        if LOG_OBJECT {
            println!(
                "{}\tGc::new() ({}) {:?}",
                "[OBJECT]".purple(),
                std::any::type_name::<T>(),
                ptr
            );
        }
        Self {
            ptr: NonNull::from(ptr),
        }
    }
}

impl<T: ?Sized> Gc<T> {
    /// Returns a reference to the inner type `T`.
    pub fn as_ref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }

    /// Returns a mutable reference to the inner type `T`.
    pub fn as_mut(&mut self) -> &mut T {
        unsafe { &mut self.ptr.as_mut().data }
    }

    /// Identity comparison; with string interning this doubles as content
    /// equality for strings.
    pub fn ptr_eq(lhs: &Self, rhs: &Self) -> bool {
        lhs.ptr == rhs.ptr
    }

    pub(super) fn mark(&self) {
        unsafe { self.ptr.as_ref() }.mark();
    }

    pub(super) fn marked(&self) -> bool {
        unsafe { self.ptr.as_ref() }.marked()
    }
}

impl<T: ?Sized> Copy for Gc<T> {}

impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl<T: ?Sized> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut()
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc {{ ptr: {:?} }}", self.ptr.as_ptr())
    }
}
