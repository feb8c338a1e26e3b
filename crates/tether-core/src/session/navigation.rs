//! Hierarchy-aware navigation between sessions
//!
//! Sessions are ordered by creation, with each parent immediately followed by
//! its watchers (depth first). Moving past either end leaves the session list:
//! before the first entry is the session board, after the last is the
//! create-session dialog.

use super::types::SessionId;
use super::watch_graph::WatchGraph;

/// Where a navigation step lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTarget {
    Session(SessionId),
    /// Before the first session
    Board,
    /// After the last session
    CreateDialog,
}

impl NavigationTarget {
    pub fn session(self) -> Option<SessionId> {
        match self {
            NavigationTarget::Session(id) => Some(id),
            _ => None,
        }
    }
}

/// Order `sessions` (creation order) so every parent is followed by its watchers
pub fn build_navigation_list(sessions: &[SessionId], graph: &WatchGraph) -> Vec<SessionId> {
    fn visit(id: SessionId, sessions: &[SessionId], graph: &WatchGraph, out: &mut Vec<SessionId>) {
        if out.contains(&id) || !sessions.contains(&id) {
            return;
        }
        out.push(id);
        for watcher in graph.get_watchers(id) {
            visit(watcher, sessions, graph, out);
        }
    }

    let mut out = Vec::with_capacity(sessions.len());
    for id in sessions {
        let is_root = match graph.get_parent(*id) {
            Some(parent) => !sessions.contains(&parent),
            None => true,
        };
        if is_root {
            visit(*id, sessions, graph, &mut out);
        }
    }
    out
}

pub fn next_target(list: &[SessionId], active: Option<SessionId>) -> NavigationTarget {
    let next = match active.and_then(|id| list.iter().position(|s| *s == id)) {
        Some(index) => list.get(index + 1),
        None => list.first(),
    };
    next.map_or(NavigationTarget::CreateDialog, |id| NavigationTarget::Session(*id))
}

pub fn prev_target(list: &[SessionId], active: Option<SessionId>) -> NavigationTarget {
    match active.and_then(|id| list.iter().position(|s| *s == id)) {
        Some(index) if index > 0 => NavigationTarget::Session(list[index - 1]),
        _ => NavigationTarget::Board,
    }
}
