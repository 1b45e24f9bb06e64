//! # Referral Forest Traversal
//!
//! Iterative walks over the inviter relation. Every walk carries a visited
//! set, so a corrupt cycle ends the walk instead of looping forever. The
//! upward walk is also bounded by a hop limit.

use std::collections::{HashSet, VecDeque};
use tally_core::{ParticipantId, ReferralForest, Result};

/// Why an upward walk ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WalkStop {
    /// Reached a participant with no inviter
    #[default]
    Root,
    /// Hop limit reached
    DepthLimit,
    /// Inviter already visited
    Cycle,
}

/// Step-by-step walk from a participant's inviter towards the root
pub struct AncestorWalk<'a> {
    forest: &'a dyn ReferralForest,
    current: ParticipantId,
    visited: HashSet<ParticipantId>,
    max_depth: usize,
    depth: usize,
    stop: Option<WalkStop>,
}

impl<'a> AncestorWalk<'a> {
    pub fn new(forest: &'a dyn ReferralForest, start: ParticipantId, max_depth: usize) -> Self {
        let mut visited = HashSet::new();
        visited.insert(start);
        Self {
            forest,
            current: start,
            visited,
            max_depth,
            depth: 0,
            stop: None,
        }
    }

    /// Next ancestor, `None` once the walk has ended
    pub async fn next(&mut self) -> Result<Option<ParticipantId>> {
        if self.stop.is_some() {
            return Ok(None);
        }
        if self.depth >= self.max_depth {
            self.stop = Some(WalkStop::DepthLimit);
            return Ok(None);
        }

        let Some(inviter) = self.forest.inviter(self.current).await? else {
            self.stop = Some(WalkStop::Root);
            return Ok(None);
        };
        if !self.visited.insert(inviter) {
            self.stop = Some(WalkStop::Cycle);
            return Ok(None);
        }

        self.current = inviter;
        self.depth += 1;
        Ok(Some(inviter))
    }

    /// Hops taken so far
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Reason the walk ended, `None` while it is still running
    pub fn stop_reason(&self) -> Option<WalkStop> {
        self.stop
    }
}

/// Ancestors of a participant, nearest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ancestry {
    pub ancestors: Vec<ParticipantId>,
    pub stop: WalkStop,
}

pub async fn walk_ancestors(
    forest: &dyn ReferralForest,
    participant: ParticipantId,
    max_depth: usize,
) -> Result<Ancestry> {
    let mut walk = AncestorWalk::new(forest, participant, max_depth);
    let mut ancestors = Vec::new();
    while let Some(ancestor) = walk.next().await? {
        ancestors.push(ancestor);
    }
    Ok(Ancestry {
        ancestors,
        stop: walk.stop_reason().unwrap_or_default(),
    })
}

/// A downline participant and its distance from the root of the walk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownlineMember {
    pub participant: ParticipantId,
    pub depth: usize,
}

/// Everyone below a participant, in breadth-first order
#[derive(Clone, Debug, Default)]
pub struct Downline {
    pub members: Vec<DownlineMember>,
    /// Members at depth 1
    pub direct: usize,
    /// An edge pointed back at an already visited participant
    pub cycle_detected: bool,
}

impl Downline {
    /// Deepest level reached, 0 when the downline is empty
    pub fn depth(&self) -> usize {
        self.members.last().map(|m| m.depth).unwrap_or(0)
    }

    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.members.iter().map(|m| m.participant)
    }
}

/// Breadth-first enumeration of the downline rooted at `root`
pub async fn collect_downline(forest: &dyn ReferralForest, root: ParticipantId) -> Result<Downline> {
    let mut downline = Downline::default();
    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([(root, 0usize)]);

    while let Some((node, depth)) = queue.pop_front() {
        for child in forest.direct_referrals(node).await? {
            if !visited.insert(child) {
                downline.cycle_detected = true;
                continue;
            }
            if depth == 0 {
                downline.direct += 1;
            }
            downline.members.push(DownlineMember {
                participant: child,
                depth: depth + 1,
            });
            queue.push_back((child, depth + 1));
        }
    }

    if downline.cycle_detected {
        tracing::warn!(%root, "Cycle detected in referral forest below participant");
    }
    Ok(downline)
}

/// Number of levels below `root`
pub async fn downline_depth(forest: &dyn ReferralForest, root: ParticipantId) -> Result<usize> {
    Ok(collect_downline(forest, root).await?.depth())
}
