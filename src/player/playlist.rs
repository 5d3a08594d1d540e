//! Playlist owned by the player facade
//!
//! Items are addressed by index. The cursor names the item that is playing
//! (or was last played) and survives the sessions it starts.

use serde::{Deserialize, Serialize};

/// One playable entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// File path or URL handed to the media backend
    pub locator: String,

    /// Display title, overriding the container's title tag
    pub title: Option<String>,
}

impl PlaylistItem {
    /// Create an item without a title
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            title: None,
        }
    }

    /// Set the display title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Ordered list of items with a cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    cursor: Option<usize>,
    repeat: bool,
}

impl Playlist {
    /// Replace the items and point the cursor at `selected`
    ///
    /// Returns `false` (and leaves the playlist unchanged) when `selected`
    /// is out of range for a non-empty list.
    pub fn replace(&mut self, items: Vec<PlaylistItem>, selected: usize) -> bool {
        if !items.is_empty() && selected >= items.len() {
            return false;
        }
        self.cursor = (!items.is_empty()).then_some(selected);
        self.items = items;
        true
    }

    /// Remove every item
    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = None;
    }

    /// Wrap around at either end
    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// Whether the playlist wraps around
    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the playlist has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the current item
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// The current item
    pub fn current(&self) -> Option<&PlaylistItem> {
        self.cursor.and_then(|i| self.items.get(i))
    }

    /// Item at `index`
    pub fn get(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }

    /// All items in order
    pub fn items(&self) -> &[PlaylistItem] {
        &self.items
    }

    /// Index `delta` steps away from the cursor, honoring the repeat flag
    pub fn offset(&self, delta: i64) -> Option<usize> {
        self.offset_from(self.cursor?, delta)
    }

    /// Index `delta` steps away from `index`, honoring the repeat flag
    pub fn offset_from(&self, index: usize, delta: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let target = index as i64 + delta;
        if (0..len).contains(&target) {
            Some(target as usize)
        } else if self.repeat && len > 0 {
            Some(target.rem_euclid(len) as usize)
        } else {
            None
        }
    }

    /// Move the cursor to `index`
    pub fn select(&mut self, index: usize) -> Option<&PlaylistItem> {
        if index >= self.items.len() {
            return None;
        }
        self.cursor = Some(index);
        self.items.get(index)
    }

    /// Index of the item playing `locator`, preferring the cursor
    pub fn position_of(&self, locator: &str) -> Option<usize> {
        if self.current().is_some_and(|item| item.locator == locator) {
            return self.cursor;
        }
        self.items.iter().position(|item| item.locator == locator)
    }
}
