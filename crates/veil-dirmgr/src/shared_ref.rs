//! Utility module to safely refer to a mutable Arc.

use std::sync::{Arc, RwLock};

use crate::{Error, Result};

/// A shareable mutable-ish optional reference to an [`Arc`].
///
/// Because you can't actually change a shared [`Arc`], this type
/// implements mutability by replacing the Arc itself with a new value.
/// It tries to avoid needless clones by taking advantage of
/// [`Arc::make_mut`].
///
/// Readers that hold a clone of the inner Arc keep seeing the old value
/// until they next call [`get`](SharedMutArc::get); a swap is atomic
/// with respect to lookups.
//
// We give this construction its own type to simplify its users, and
// make sure we never hold the lock longer than a single call.
#[derive(Debug)]
pub struct SharedMutArc<T> {
    /// Locked reference to the current value.
    dir: RwLock<Option<Arc<T>>>,
}

impl<T> Default for SharedMutArc<T> {
    fn default() -> Self {
        SharedMutArc {
            dir: RwLock::new(None),
        }
    }
}

impl<T> SharedMutArc<T> {
    /// Construct a new empty SharedMutArc.
    pub fn new() -> Self {
        SharedMutArc::default()
    }

    /// Replace the current value with `new_val`.
    pub fn replace(&self, new_val: T) {
        let mut w = self
            .dir
            .write()
            .expect("Poisoned lock for directory reference");
        *w = Some(Arc::new(new_val));
    }

    /// Remove the current value of this SharedMutArc.
    pub(crate) fn clear(&self) {
        let mut w = self
            .dir
            .write()
            .expect("Poisoned lock for directory reference");
        *w = None;
    }

    /// Return a new reference to the current value, if there is one.
    pub fn get(&self) -> Option<Arc<T>> {
        let r = self
            .dir
            .read()
            .expect("Poisoned lock for directory reference");
        r.as_ref().map(Arc::clone)
    }

    /// Replace the contents of this SharedMutArc with the results of
    /// applying `func` to the inner value.
    ///
    /// Gives an error if there is no inner value.
    pub fn mutate<F, U>(&self, func: F) -> Result<U>
    where
        F: FnOnce(&mut T) -> Result<U>,
        T: Clone,
    {
        let mut writeable = self
            .dir
            .write()
            .expect("Poisoned lock for directory reference");
        match writeable.as_mut() {
            None => Err(Error::DirectoryNotPresent),
            Some(arc) => func(Arc::make_mut(arc)),
        }
    }
}
