//! Grid Positions
//!
//! Integer (row, col) cells and the two distance metrics the game uses.

use std::fmt;
use serde::{Serialize, Deserialize};

/// A cell on the field as (row, col).
///
/// Serialized as a two-element array `[row, col]` so views can send
/// positions as plain JSON arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Position {
    /// Row (line) index
    pub row: i32,
    /// Column index
    pub col: i32,
}

impl Position {
    /// Sentinel for "no position".
    pub const INVALID: Position = Position { row: -1, col: -1 };

    /// Create a position.
    #[inline]
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// Check whether this is the invalid sentinel.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.row >= 0 && self.col >= 0
    }

    /// Euclidean distance.
    #[inline]
    pub fn distance(self, other: Position) -> f64 {
        let dr = (self.row - other.row) as f64;
        let dc = (self.col - other.col) as f64;
        (dr * dr + dc * dc).sqrt()
    }

    /// Chebyshev distance (king moves).
    #[inline]
    pub fn chebyshev(self, other: Position) -> i32 {
        (self.row - other.row).abs().max((self.col - other.col).abs())
    }

    /// Check if two cells touch (including diagonals) and differ.
    #[inline]
    pub fn is_adjacent(self, other: Position) -> bool {
        self != other && self.chebyshev(other) == 1
    }

    /// Euclidean distance lies in `[min, max]`.
    #[inline]
    pub fn in_range(self, center: Position, min: f64, max: f64) -> bool {
        let d = self.distance(center);
        d >= min && d <= max
    }
}

impl From<[i32; 2]> for Position {
    fn from(v: [i32; 2]) -> Self {
        Self::new(v[0], v[1])
    }
}

impl From<Position> for [i32; 2] {
    fn from(p: Position) -> Self {
        [p.row, p.col]
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}|{})", self.row, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = Position::new(0, 0);
        let b = Position::new(3, 4);
        assert_eq!(a.distance(b), 5.0);
        assert_eq!(a.chebyshev(b), 4);
        assert!(a.is_adjacent(Position::new(1, 1)));
        assert!(!a.is_adjacent(a));
    }

    #[test]
    fn test_json_as_array() {
        let p = Position::new(12, 7);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "[12,7]");
        let back: Position = serde_json::from_str("[12,7]").unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_ordering_is_row_major() {
        assert!(Position::new(0, 9) < Position::new(1, 0));
        assert!(Position::new(1, 0) < Position::new(1, 1));
    }
}
