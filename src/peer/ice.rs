use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::peer::types::IceCandidate;

/// Remote candidates received before the remote description, plus the set
/// already applied so duplicates are dropped.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
    seen: HashSet<(String, Option<u16>)>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a candidate; returns `false` for a duplicate.
    pub fn admit(&mut self, candidate: &IceCandidate) -> bool {
        let key = (candidate.candidate.clone(), candidate.sdp_m_line_index);
        let fresh = self.seen.insert(key);
        if !fresh {
            debug!(candidate = %candidate.candidate, "Duplicate ICE candidate ignored");
        }
        fresh
    }

    /// Queues an admitted candidate until the remote description is set.
    pub fn defer(&mut self, candidate: IceCandidate) {
        debug!(candidate = %candidate.candidate, "Remote description not set yet, queuing candidate");
        self.pending.push(candidate);
    }

    /// Drains queued candidates in arrival order.
    pub fn drain_pending(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forgets everything, used on ICE restart and close.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }
}

/// Candidate counts by type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "Candidate analysis"
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found, connection through NAT may fail");
    }

    summary
}
