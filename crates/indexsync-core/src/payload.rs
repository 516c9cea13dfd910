//! Indexing Event Payload
//!
//! This module defines the unit carried by every queued indexing event.
//!
//! ## What is a Payload?
//! When an entity changes, the (external) dirtiness computation decides which
//! documents must be refreshed and hands one payload per affected document to
//! the outbox. A payload answers two questions for the consumer:
//! - **What changed?** → [`DirtinessDescriptor`] (dirty paths plus overrides)
//! - **Where is the document?** → [`DocumentRoutesDescriptor`] (current route
//!   and every route the document may previously have been indexed under)
//!
//! ## Why Previous Routes?
//! Events are delivered at least once. A consumer cannot rely on its memory
//! of where a document used to live, so the payload itself carries the old
//! routes. Applying the same payload twice issues the same add/delete pair,
//! which keeps application idempotent.
//!
//! ## Example
//! ```ignore
//! let payload = IndexingQueueEventPayload::new(
//!     DocumentRoutesDescriptor::new(
//!         DocumentRouteDescriptor::of("tenant-2"),
//!         vec![DocumentRouteDescriptor::of("tenant-1")],
//!     ),
//!     Some(DirtinessDescriptor::from_paths(["title", "author.name"])),
//! );
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Dirty paths of an entity, plus flags that override path-based decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtinessDescriptor {
    /// Paths whose values changed (e.g. `"title"`, `"author.name"`)
    pub dirty_paths: BTreeSet<String>,

    /// Reindex the document itself regardless of `dirty_paths`
    pub force_self_dirty: bool,

    /// Reindex containing documents regardless of `dirty_paths`
    pub force_containing_dirty: bool,

    /// Dirtiness was propagated from a contained object
    pub update_because_of_contained: bool,
}

impl DirtinessDescriptor {
    /// Dirtiness made only of the given paths, with every flag cleared.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dirty_paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// True if nothing would trigger a reindex.
    pub fn is_empty(&self) -> bool {
        self.dirty_paths.is_empty()
            && !self.force_self_dirty
            && !self.force_containing_dirty
            && !self.update_because_of_contained
    }
}

/// A single document route. `None` means the document is not routed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRouteDescriptor {
    pub routing_key: Option<String>,
}

impl DocumentRouteDescriptor {
    /// Route with the given routing key
    pub fn of(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
        }
    }

    /// Route without a routing key
    pub fn unrouted() -> Self {
        Self { routing_key: None }
    }
}

/// Current route of a document plus the routes it may previously have used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRoutesDescriptor {
    pub current_route: DocumentRouteDescriptor,

    /// Ordered; may contain the unrouted route
    pub previous_routes: Vec<DocumentRouteDescriptor>,
}

impl DocumentRoutesDescriptor {
    pub fn new(
        current_route: DocumentRouteDescriptor,
        previous_routes: Vec<DocumentRouteDescriptor>,
    ) -> Self {
        Self {
            current_route,
            previous_routes,
        }
    }

    /// Previous routes that differ from the current one, i.e. the routes a
    /// consumer has to issue a delete for.
    pub fn stale_routes(&self) -> impl Iterator<Item = &DocumentRouteDescriptor> {
        self.previous_routes
            .iter()
            .filter(move |route| **route != self.current_route)
    }
}

/// The payload stored alongside each queued event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingQueueEventPayload {
    pub routes: DocumentRoutesDescriptor,

    /// Absent for plain add/delete events that carry only routing
    pub dirtiness: Option<DirtinessDescriptor>,
}

impl IndexingQueueEventPayload {
    pub fn new(routes: DocumentRoutesDescriptor, dirtiness: Option<DirtinessDescriptor>) -> Self {
        Self { routes, dirtiness }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_routes_skip_current() {
        let routes = DocumentRoutesDescriptor::new(
            DocumentRouteDescriptor::of("b"),
            vec![
                DocumentRouteDescriptor::of("a"),
                DocumentRouteDescriptor::of("b"),
                DocumentRouteDescriptor::unrouted(),
            ],
        );

        let stale: Vec<_> = routes.stale_routes().cloned().collect();
        assert_eq!(
            stale,
            vec![
                DocumentRouteDescriptor::of("a"),
                DocumentRouteDescriptor::unrouted()
            ]
        );
    }

    #[test]
    fn test_dirtiness_is_empty() {
        assert!(DirtinessDescriptor::default().is_empty());
        assert!(!DirtinessDescriptor::from_paths(["title"]).is_empty());

        let forced = DirtinessDescriptor {
            force_self_dirty: true,
            ..Default::default()
        };
        assert!(!forced.is_empty());
    }
}
