//! Review Coordinator
//!
//! Serializes human attention: stage execution is concurrent across jobs, but
//! at most one review request is surfaced to the reviewer at any time. Other
//! requests wait in FIFO order and are promoted as decisions come in.
//!
//! The executor parks a language's progress on the oneshot receiver returned
//! by [`ReviewCoordinator::submit`]; a dropped coordinator (or a discarded
//! pending request) reads back as a cancel, never a deadlock.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::core::{
    events::{CoreEvent, EventBus},
    ReviewDecision, ReviewRequest,
};

struct PendingReview {
    request: ReviewRequest,
    decision_tx: oneshot::Sender<ReviewDecision>,
}

struct CoordinatorState {
    active: Option<PendingReview>,
    queue: VecDeque<PendingReview>,
}

/// FIFO coordinator with a single globally active review.
pub struct ReviewCoordinator {
    state: Mutex<CoordinatorState>,
    events: EventBus,
}

impl ReviewCoordinator {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                active: None,
                queue: VecDeque::new(),
            }),
            events,
        }
    }

    /// Enqueues a review request. When no review is active the request is
    /// surfaced immediately (a `ReviewRequired` event fires); otherwise it
    /// waits its turn. The returned receiver resolves with the decision.
    pub fn submit(&self, request: ReviewRequest) -> oneshot::Receiver<ReviewDecision> {
        let (decision_tx, decision_rx) = oneshot::channel();
        let pending = PendingReview {
            request,
            decision_tx,
        };

        let surfaced = {
            let mut state = self.state.lock().unwrap();
            if state.active.is_none() {
                let request = pending.request.clone();
                state.active = Some(pending);
                Some(request)
            } else {
                debug!(
                    "Review for {}/{} queued behind active review",
                    pending.request.job_id, pending.request.lang_id
                );
                state.queue.push_back(pending);
                None
            }
        };

        if let Some(request) = surfaced {
            self.emit_required(&request);
        }
        decision_rx
    }

    /// Applies the reviewer's decision to the active request and surfaces the
    /// next queued one, if any. Returns `false` when no review was active.
    pub fn resolve(&self, decision: ReviewDecision) -> bool {
        let (resolved, next) = {
            let mut state = self.state.lock().unwrap();
            let Some(active) = state.active.take() else {
                return false;
            };
            let next = state.queue.pop_front();
            let next_request = next.as_ref().map(|p| p.request.clone());
            state.active = next;
            (active, next_request)
        };

        // The waiting stage may have been abandoned (job deleted); a closed
        // receiver is fine.
        let _ = resolved.decision_tx.send(decision);

        if let Some(request) = next {
            self.emit_required(&request);
        }
        true
    }

    /// The request currently presented to the reviewer.
    pub fn active_request(&self) -> Option<ReviewRequest> {
        let state = self.state.lock().unwrap();
        state.active.as_ref().map(|p| p.request.clone())
    }

    /// Requests waiting behind the active one.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().active.is_none()
    }

    fn emit_required(&self, request: &ReviewRequest) {
        self.events.emit(CoreEvent::ReviewRequired {
            job_id: request.job_id.clone(),
            lang_id: request.lang_id.clone(),
            candidate_text: request.candidate_text.clone(),
        });
    }
}
