//! Mood renderer seam
//!
//! The light renderer is driven by mood name only. Names it does not know
//! are logged and ignored.

use parking_lot::RwLock;
use tracing::{info, warn};

/// Most moods a board holds
pub const MAX_MOODS: usize = 8;

/// Moods every device knows out of the box
pub const DEFAULT_MOODS: [&str; MAX_MOODS] = [
    "happy",
    "sad",
    "anger",
    "confused",
    "excited",
    "flirty",
    "relaxed",
    "surprised",
];

/// Something that renders the active mood
pub trait Renderer: Send + Sync {
    /// Make `name` the active mood; false (and no change) if unknown
    fn set_mood(&self, name: &str) -> bool;

    /// Currently active mood
    fn active(&self) -> Option<String>;

    /// Known moods in registration order
    fn moods(&self) -> Vec<String>;
}

struct Board {
    moods: Vec<String>,
    active: Option<usize>,
}

/// Ordered registry of mood effects with one active entry
pub struct MoodBoard {
    board: RwLock<Board>,
}

impl MoodBoard {
    pub fn new() -> Self {
        Self {
            board: RwLock::new(Board {
                moods: Vec::with_capacity(MAX_MOODS),
                active: None,
            }),
        }
    }

    /// Board holding [`DEFAULT_MOODS`]
    pub fn with_default_moods() -> Self {
        let board = Self::new();
        for mood in DEFAULT_MOODS {
            board.add(mood);
        }
        board
    }

    /// Register a mood; false if it exists or the board is full
    pub fn add(&self, name: &str) -> bool {
        let mut board = self.board.write();
        if board.moods.len() >= MAX_MOODS || board.moods.iter().any(|m| m == name) {
            warn!("Mood '{}' already exists or board is full", name);
            return false;
        }
        board.moods.push(name.to_string());
        true
    }
}

impl Default for MoodBoard {
    fn default() -> Self {
        Self::with_default_moods()
    }
}

impl Renderer for MoodBoard {
    fn set_mood(&self, name: &str) -> bool {
        let mut board = self.board.write();
        match board.moods.iter().position(|m| m == name) {
            Some(index) => {
                board.active = Some(index);
                info!("Mood set to '{}'", name);
                true
            }
            None => {
                warn!("Mood <{}> not found", name);
                false
            }
        }
    }

    fn active(&self) -> Option<String> {
        let board = self.board.read();
        board.active.map(|i| board.moods[i].clone())
    }

    fn moods(&self) -> Vec<String> {
        self.board.read().moods.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_mood_is_ignored() {
        let board = MoodBoard::with_default_moods();
        assert!(board.set_mood("sad"));
        assert!(!board.set_mood("bored"));
        assert_eq!(board.active().as_deref(), Some("sad"));
    }

    #[test]
    fn test_board_capacity_and_duplicates() {
        let board = MoodBoard::with_default_moods();
        assert_eq!(board.moods().len(), MAX_MOODS);
        assert!(!board.add("calm"));

        let board = MoodBoard::new();
        assert!(board.add("calm"));
        assert!(!board.add("calm"));
        assert_eq!(board.active(), None);
    }
}
