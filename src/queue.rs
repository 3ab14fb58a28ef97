//! Command queue between the control channel, engine callbacks, and the
//! dispatch thread.
//!
//! The queue is FIFO with one extension: tile requests that intersect a
//! recently reported cursor rectangle are moved ahead of those that do not,
//! so the tile under the cursor renders first after a burst. Relative order
//! is preserved within each group, and non-tile payloads never move.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::protocol::tokenize;
use crate::tiles::{Rect, TileCombined, TileDesc};

/// A queued command, in its original textual framing.
pub type Payload = Vec<u8>;

/// Whether tile requests may be reordered toward the cursor.
///
/// Fixed at construction; tests pin `Fifo` for deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prioritization {
    #[default]
    CursorAware,
    Fifo,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Payload>,
    /// Most recent cursor rectangle per (view, part).
    cursors: HashMap<(i32, i32), Rect>,
}

/// Thread-safe command queue with cursor-aware tile prioritization.
pub struct TileQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    prioritization: Prioritization,
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new(Prioritization::CursorAware)
    }
}

impl TileQueue {
    pub fn new(prioritization: Prioritization) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            prioritization,
        }
    }

    /// Enqueue a command.
    ///
    /// `canceltiles` is consumed here: it drops the pending tile requests
    /// and is not itself enqueued. Duplicate tile requests are coalesced.
    pub fn put(&self, message: impl Into<Payload>) {
        let payload = message.into();
        let text = String::from_utf8_lossy(&payload).into_owned();
        let first = text.split_whitespace().next().unwrap_or("").to_string();

        let mut state = self.state.lock().unwrap();

        if first == "canceltiles" {
            state.queue.retain(|pending| !is_tile_class(pending));
            return;
        }

        let tile_class = first == "tile" || first == "tilecombine";
        if tile_class && state.queue.iter().any(|pending| *pending == payload) {
            tracing::trace!("Skipping duplicate tile request: {}", text);
            return;
        }

        state.queue.push_back(payload);

        if tile_class && self.prioritization == Prioritization::CursorAware {
            reorder_tiles(&mut state);
        }

        drop(state);
        self.cv.notify_one();
    }

    /// Dequeue the next command, blocking until one is available.
    pub fn get(&self) -> Payload {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(payload) = state.queue.pop_front() {
                return payload;
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Record the latest cursor rectangle for a (view, part) pair.
    pub fn update_cursor_position(&self, view_id: i32, part: i32, rect: Rect) {
        let mut state = self.state.lock().unwrap();
        state.cursors.insert((view_id, part), rect);
    }

    /// Drop all cursor entries belonging to a view, on unload.
    pub fn remove_cursor_position(&self, view_id: i32) {
        let mut state = self.state.lock().unwrap();
        state.cursors.retain(|(view, _), _| *view != view_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

/// True for payloads that `canceltiles` removes.
fn is_tile_class(payload: &[u8]) -> bool {
    let text = String::from_utf8_lossy(payload);
    matches!(text.split_whitespace().next(), Some("tile") | Some("tilecombine"))
}

/// Stable-partition the pending tile requests so cursor-intersecting ones
/// come first. Non-tile payloads keep their slots.
fn reorder_tiles(state: &mut QueueState) {
    let tile_slots: Vec<usize> = state
        .queue
        .iter()
        .enumerate()
        .filter_map(|(i, p)| is_tile_class(p).then_some(i))
        .collect();
    if tile_slots.len() < 2 {
        return;
    }

    let mut hot = Vec::new();
    let mut cold = Vec::new();
    for &slot in &tile_slots {
        let payload = state.queue[slot].clone();
        if intersects_cursor(&payload, &state.cursors) {
            hot.push(payload);
        } else {
            cold.push(payload);
        }
    }
    if hot.is_empty() || cold.is_empty() {
        return;
    }

    for (slot, payload) in tile_slots.into_iter().zip(hot.into_iter().chain(cold)) {
        state.queue[slot] = payload;
    }
}

/// Whether any sub-tile of the request intersects a known cursor rectangle
/// on the same part.
fn intersects_cursor(payload: &[u8], cursors: &HashMap<(i32, i32), Rect>) -> bool {
    let text = String::from_utf8_lossy(payload);
    let tokens = tokenize(&text);
    let rects: Vec<(i32, Rect)> = match tokens.first() {
        Some(&"tile") => match TileDesc::parse(&tokens) {
            Ok(tile) => vec![(tile.part, tile.rect())],
            Err(_) => return false,
        },
        Some(&"tilecombine") => match TileCombined::parse(&tokens) {
            Ok(combined) => combined
                .tiles
                .iter()
                .map(|t| (t.part, t.rect()))
                .collect(),
            Err(_) => return false,
        },
        _ => return false,
    };

    rects.iter().any(|(part, rect)| {
        cursors
            .iter()
            .any(|((_, cursor_part), cursor)| cursor_part == part && cursor.intersects(rect))
    })
}
