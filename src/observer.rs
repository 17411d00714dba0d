//! The subscription contract the coordinator plugs into.
//!
//! A [`Source`] hands every [`Observer`] exactly one handle through
//! [`Observer::on_subscribe`], before any other event. After that it emits
//! zero or more values followed by at most one terminal event
//! (`on_error` or `on_complete`). Cancelling the handle asks the source to
//! stop; a source may still race a few events past a cancel.

use std::sync::Arc;

use crate::error::Error;
use crate::handle::Handle;

/// Receives the events of one subscription.
pub trait Observer<T>: Send + Sync {
    /// Called once, first, with the handle that cancels this subscription.
    fn on_subscribe(&self, handle: Handle);

    /// A value.
    fn on_next(&self, value: T);

    /// Terminal failure.
    fn on_error(&self, error: Error);

    /// Terminal success.
    fn on_complete(&self);
}

/// Something that can be subscribed to.
pub trait Source<T>: Send + Sync {
    /// Attaches `observer`. The source must call `observer.on_subscribe`
    /// before delivering anything else.
    fn subscribe(&self, observer: Arc<dyn Observer<T>>);
}

impl<T, S> Source<T> for Arc<S>
where
    S: Source<T> + ?Sized,
{
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        (**self).subscribe(observer);
    }
}
