//! Cascade suppression for errors propagating through layers.
//!
//! When one failure bubbles up from the domain layer through the service
//! layer to the API layer, each layer sees it. `ErrorContext` makes sure the
//! detailed record is written once, while every occurrence still counts.

use std::any::type_name;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::errors::BoundaryError;

/// Derives the logical identity of an error: short type name plus message.
///
/// Instance identity plays no part. Two distinct values with the same type
/// and message are the same logical error. A [`BoundaryError::Layer`]
/// reports the identity of the error it wraps.
pub fn error_identity<E>(error: &E) -> String
where
    E: StdError + 'static,
{
    let dynamic: &(dyn StdError + 'static) = error;
    if let Some(boundary) = dynamic.downcast_ref::<BoundaryError>() {
        return boundary.identity();
    }
    format!("{}: {error}", short_type_name::<E>())
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Per-request record of which errors have already been reported.
#[derive(Debug, Default)]
pub struct ErrorContext {
    reported: Mutex<HashSet<String>>,
    occurrences: AtomicUsize,
}

impl ErrorContext {
    /// Creates an empty error context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time this logical error is offered for
    /// reporting in the request, false for every later layer.
    pub fn should_log_error<E>(&self, layer: &str, error: &E) -> bool
    where
        E: StdError + 'static,
    {
        self.should_log_identity(layer, &error_identity(error))
    }

    /// Identity-based form of [`should_log_error`](Self::should_log_error).
    pub fn should_log_identity(&self, layer: &str, identity: &str) -> bool {
        let first = self.reported.lock().insert(identity.to_string());
        if !first {
            tracing::trace!(layer, identity, "Suppressing cascaded error report");
        }
        first
    }

    /// Records an occurrence whether or not it gets logged.
    pub fn add_layer_error<E>(&self, layer: &str, error: &E)
    where
        E: StdError + 'static,
    {
        self.add_layer_identity(layer, &error_identity(error));
    }

    /// Identity-based form of [`add_layer_error`](Self::add_layer_error).
    pub fn add_layer_identity(&self, layer: &str, identity: &str) {
        let total = self.occurrences.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(layer, identity, total, "Recorded layer error");
    }

    /// Records the occurrence and decides on detailed logging in one step.
    pub fn observe<E>(&self, layer: &str, error: &E) -> bool
    where
        E: StdError + 'static,
    {
        let identity = error_identity(error);
        self.add_layer_identity(layer, &identity);
        self.should_log_identity(layer, &identity)
    }

    /// Total occurrences recorded, including suppressed ones.
    pub fn error_count(&self) -> usize {
        self.occurrences.load(Ordering::Relaxed)
    }

    /// Number of distinct logical errors reported.
    pub fn distinct_errors(&self) -> usize {
        self.reported.lock().len()
    }
}
