// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-rank object handles.
//!
//! A [`Handle`] names an object that exists once per rank: every rank
//! constructs its local instance and registers it, in the same program order,
//! with [`crate::Comm::register`]. The handle is a plain index into that
//! registration order, so the same handle value dereferences to the peer
//! instance on whichever rank executes it. Handles are `Copy` and `Send` and
//! are meant to travel inside `async_call` closures.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

/// Logically stable cross-rank name for a collectively registered object.
///
/// The `PhantomData<fn() -> T>` brand keeps resolution type-safe without
/// making the handle's sendability depend on `T`.
pub struct Handle<T> {
    index: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Position of the object in the collective registration order.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.index).finish()
    }
}

/// Rank-local table of registered objects, indexed by registration order.
///
/// Entries are never removed; a handle stays valid for the rest of the job.
#[derive(Default)]
pub(crate) struct Registry {
    objects: RefCell<Vec<Rc<dyn Any>>>,
}

impl Registry {
    pub(crate) fn register<T: 'static>(&self, obj: Rc<T>) -> Handle<T> {
        let mut objects = self.objects.borrow_mut();
        let index = objects.len();
        objects.push(obj);
        Handle {
            index,
            _type: PhantomData,
        }
    }

    pub(crate) fn resolve<T: 'static>(&self, handle: Handle<T>) -> Rc<T> {
        let objects = self.objects.borrow();
        let obj = objects
            .get(handle.index)
            .unwrap_or_else(|| panic!("handle {} was never registered on this rank", handle.index));
        Rc::clone(obj)
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("handle {} resolves to a different type", handle.index))
    }
}
