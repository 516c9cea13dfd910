//! Rebalancing State Machine
//!
//! Decides, pulse after pulse, whether an agent may drain its shard.
//!
//! ## States
//!
//! - **REBALANCING**: not draining. Entered on join, after any membership
//!   change, and on identity loss. Left for RUNNING once the same
//!   resolution has been observed `stabilization_reads` times in a row.
//! - **RUNNING**: draining the committed assignment. Any different
//!   resolution sends the agent back to REBALANCING.
//! - **SUSPENDED**: administratively paused; observations are ignored until
//!   `resume()`.
//!
//! ```text
//!                 same resolution × N
//!   REBALANCING ───────────────────────▶ RUNNING
//!        ▲  ▲                               │
//!        │  └──── different / none ─────────┘
//!        │
//!     resume()        suspend() from any state
//!        │
//!   SUSPENDED ◀─────────────────────────────
//! ```
//!
//! Reads are one pulse apart, so a new owner only starts draining a range
//! after the previous owner has had at least one pulse to notice the change
//! and stop.
//!
//! The machine does no I/O; the pulse loop feeds it and persists its state.

use crate::resolver::Resolution;
use indexsync_core::ShardAssignment;
use indexsync_metadata::EventProcessingState;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of identical consecutive reads before draining
pub const DEFAULT_STABILIZATION_READS: u32 = 2;

/// State change produced by one call on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: EventProcessingState,
    pub to: EventProcessingState,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone)]
pub struct EventProcessingStateMachine {
    stabilization_reads: u32,
    state: EventProcessingState,

    /// Resolution being stabilized while REBALANCING
    candidate: Option<Resolution>,

    /// Consecutive reads of `candidate`
    consecutive: u32,

    /// Resolution being drained while RUNNING
    committed: Option<Resolution>,
}

impl EventProcessingStateMachine {
    /// New machine in REBALANCING (joining). A zero window is treated as 1.
    pub fn new(stabilization_reads: u32) -> Self {
        Self {
            stabilization_reads: stabilization_reads.max(1),
            state: EventProcessingState::Rebalancing,
            candidate: None,
            consecutive: 0,
            committed: None,
        }
    }

    pub fn state(&self) -> EventProcessingState {
        self.state
    }

    /// Resolution being drained; `Some` only while RUNNING.
    pub fn committed(&self) -> Option<&Resolution> {
        self.committed.as_ref()
    }

    /// Shard being drained; `Some` only while RUNNING.
    pub fn assignment(&self) -> Option<ShardAssignment> {
        self.committed.as_ref().map(|r| r.assignment)
    }

    /// Feed the resolution read at this pulse.
    pub fn observe(&mut self, resolution: Option<Resolution>) -> Transition {
        let from = self.state;

        match (self.state, resolution) {
            (EventProcessingState::Suspended, _) => {}

            (_, None) => self.enter_rebalancing(None),

            (EventProcessingState::Running, Some(resolution)) => {
                if self.committed.as_ref() != Some(&resolution) {
                    debug!(
                        previous = ?self.committed,
                        next = ?resolution,
                        "Resolution changed, rebalancing"
                    );
                    self.enter_rebalancing(Some(resolution));
                }
            }

            (EventProcessingState::Rebalancing, Some(resolution)) => {
                if self.candidate.as_ref() == Some(&resolution) {
                    self.consecutive += 1;
                } else {
                    self.candidate = Some(resolution);
                    self.consecutive = 1;
                }

                if self.consecutive >= self.stabilization_reads {
                    self.committed = self.candidate.take();
                    self.consecutive = 0;
                    self.state = EventProcessingState::Running;
                }
            }
        }

        Transition {
            from,
            to: self.state,
        }
    }

    /// Any state → SUSPENDED; stops draining immediately.
    pub fn suspend(&mut self) -> Transition {
        let from = self.state;
        self.clear();
        self.state = EventProcessingState::Suspended;
        Transition {
            from,
            to: self.state,
        }
    }

    /// SUSPENDED → REBALANCING; no-op otherwise.
    pub fn resume(&mut self) -> Transition {
        let from = self.state;
        if from == EventProcessingState::Suspended {
            self.enter_rebalancing(None);
        }
        Transition {
            from,
            to: self.state,
        }
    }

    /// Back to REBALANCING with an empty window (used on identity loss).
    pub fn reset(&mut self) -> Transition {
        let from = self.state;
        self.enter_rebalancing(None);
        Transition {
            from,
            to: self.state,
        }
    }

    fn enter_rebalancing(&mut self, candidate: Option<Resolution>) {
        self.clear();
        self.consecutive = u32::from(candidate.is_some());
        self.candidate = candidate;
        self.state = EventProcessingState::Rebalancing;
    }

    fn clear(&mut self) {
        self.candidate = None;
        self.consecutive = 0;
        self.committed = None;
    }
}

impl Default for EventProcessingStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_STABILIZATION_READS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ClusterDescriptor;
    use indexsync_metadata::AgentId;

    fn resolution(members: &[i64], me: i64) -> Resolution {
        let descriptor = ClusterDescriptor::new(members.iter().copied().map(AgentId).collect());
        Resolution {
            assignment: descriptor.assignment_of(AgentId(me)).unwrap(),
            descriptor: Some(descriptor),
        }
    }

    #[test]
    fn test_starts_rebalancing() {
        let machine = EventProcessingStateMachine::default();
        assert_eq!(machine.state(), EventProcessingState::Rebalancing);
        assert!(machine.committed().is_none());
    }

    #[test]
    fn test_runs_after_stabilization_window() {
        let mut machine = EventProcessingStateMachine::new(2);
        let r = resolution(&[1, 2], 1);

        assert!(!machine.observe(Some(r.clone())).is_change());
        assert_eq!(machine.state(), EventProcessingState::Rebalancing);

        let transition = machine.observe(Some(r.clone()));
        assert!(transition.is_change());
        assert_eq!(transition.to, EventProcessingState::Running);
        assert_eq!(machine.committed(), Some(&r));
    }

    #[test]
    fn test_changing_resolution_restarts_window() {
        let mut machine = EventProcessingStateMachine::new(3);
        machine.observe(Some(resolution(&[1, 2], 1)));
        machine.observe(Some(resolution(&[1, 2], 1)));
        machine.observe(Some(resolution(&[1, 2, 3], 1)));
        machine.observe(Some(resolution(&[1, 2, 3], 1)));
        assert_eq!(machine.state(), EventProcessingState::Rebalancing);

        machine.observe(Some(resolution(&[1, 2, 3], 1)));
        assert_eq!(machine.state(), EventProcessingState::Running);
    }

    #[test]
    fn test_running_stops_on_membership_change() {
        let mut machine = EventProcessingStateMachine::new(2);
        let r = resolution(&[1, 2, 3], 3);
        machine.observe(Some(r.clone()));
        machine.observe(Some(r.clone()));

        // Same resolution keeps running
        assert!(!machine.observe(Some(r)).is_change());

        // Peer 2 left: shard count changes, stop draining at once
        let next = resolution(&[1, 3], 3);
        let transition = machine.observe(Some(next.clone()));
        assert_eq!(transition.to, EventProcessingState::Rebalancing);
        assert!(machine.assignment().is_none());

        // The change counts as the first read of the new window
        machine.observe(Some(next));
        assert_eq!(machine.state(), EventProcessingState::Running);
        assert_eq!(machine.assignment(), ShardAssignment::new(1, 2));
    }

    #[test]
    fn test_no_resolution_resets_window() {
        let mut machine = EventProcessingStateMachine::new(2);
        let r = resolution(&[1], 1);
        machine.observe(Some(r.clone()));
        machine.observe(None);
        machine.observe(Some(r.clone()));
        assert_eq!(machine.state(), EventProcessingState::Rebalancing);
        machine.observe(Some(r));
        assert_eq!(machine.state(), EventProcessingState::Running);
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut machine = EventProcessingStateMachine::new(1);
        let r = resolution(&[1], 1);
        machine.observe(Some(r.clone()));
        assert_eq!(machine.state(), EventProcessingState::Running);

        let transition = machine.suspend();
        assert_eq!(transition.from, EventProcessingState::Running);
        assert_eq!(machine.state(), EventProcessingState::Suspended);
        assert!(machine.committed().is_none());

        // Observations are ignored while suspended
        machine.observe(Some(r.clone()));
        machine.observe(None);
        assert_eq!(machine.state(), EventProcessingState::Suspended);

        assert_eq!(machine.resume().to, EventProcessingState::Rebalancing);
        machine.observe(Some(r));
        assert_eq!(machine.state(), EventProcessingState::Running);

        // Resume outside SUSPENDED does nothing
        assert!(!machine.resume().is_change());
    }

    #[test]
    fn test_reset_clears_window() {
        let mut machine = EventProcessingStateMachine::new(2);
        let r = resolution(&[4], 4);
        machine.observe(Some(r.clone()));
        machine.observe(Some(r.clone()));

        assert_eq!(machine.reset().to, EventProcessingState::Rebalancing);
        machine.observe(Some(r));
        assert_eq!(machine.state(), EventProcessingState::Rebalancing);
    }
}
