//! Potential Collision
//!
//! Same-cell interactions between potentials of different players, and the
//! stacked symbols the views draw for occupied cells.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Deserialize};

use crate::core::Position;
use crate::game::events::GameEventData;
use crate::game::player::Player;

/// Symbol and owner color of one occupied cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackedSymbol {
    /// Drawn character
    pub symbol: char,
    /// Owner's color tag
    pub color: i32,
}

/// Stack symbol for `n` EPSPs on one cell: `1..9`, then `:`.
#[inline]
pub fn epsp_symbol(n: usize) -> char {
    char::from(b'0' + n.min(10) as u8)
}

/// Stack symbol for `n` IPSPs on one cell: `a..z`, saturating at `z`.
#[inline]
pub fn ipsp_symbol(n: usize) -> char {
    char::from(b'a' + n.saturating_sub(1).min(25) as u8)
}

/// Resolve every IPSP/EPSP encounter of this render step.
///
/// Players are visited in seat order. For each IPSP of a player and each
/// enemy with an EPSP on that cell, the IPSP gains 1 and the enemy's
/// lowest-id EPSP there loses 1 (and disappears at 0).
pub fn resolve_collisions(players: &[Arc<Player>]) -> Vec<GameEventData> {
    players.iter().flat_map(|p| p.swallow_epsps()).collect()
}

/// Stacked symbols for every cell holding potentials.
///
/// IPSP stacks always replace EPSP stacks; between stacks of the same
/// kind the larger one wins and the earlier seat keeps ties.
pub fn stacked_potentials(players: &[Arc<Player>]) -> BTreeMap<Position, StackedSymbol> {
    let counts: Vec<_> = players.iter().map(|p| (p.color(), p.potential_counts())).collect();
    stack_counts(&counts)
}

/// Stack `(color, cell -> (epsps, ipsps))` per seat into symbols.
pub fn stack_counts(counts: &[(i32, BTreeMap<Position, (usize, usize)>)]) -> BTreeMap<Position, StackedSymbol> {
    let mut stacked: BTreeMap<Position, StackedSymbol> = BTreeMap::new();
    for (color, cells) in counts {
        for (&pos, &(epsps, _)) in cells.iter().filter(|(_, c)| c.0 > 0) {
            let symbol = epsp_symbol(epsps);
            match stacked.get(&pos) {
                Some(cur) if cur.symbol >= symbol => {}
                _ => {
                    stacked.insert(pos, StackedSymbol { symbol, color: *color });
                }
            }
        }
    }
    for (color, cells) in counts {
        for (&pos, &(_, ipsps)) in cells.iter().filter(|(_, c)| c.1 > 0) {
            let symbol = ipsp_symbol(ipsps);
            match stacked.get(&pos) {
                Some(cur) if !cur.symbol.is_ascii_digit() && cur.symbol != ':' && cur.symbol >= symbol => {}
                _ => {
                    stacked.insert(pos, StackedSymbol { symbol, color: *color });
                }
            }
        }
    }
    stacked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::audio::{AnalyzedAudio, BeatFrame, RandomMode};
    use crate::game::field::Field;

    fn pair() -> Vec<Arc<Player>> {
        let beats = vec![BeatFrame {
            time: 0,
            bpm: 100.0,
            level: 0.3,
            notes: vec![64],
            off_note: false,
            minor: false,
        }];
        let audio = AnalyzedAudio::from_frames("collision-test.mp3", beats).unwrap();
        let ran = Arc::new(Mutex::new(audio.generator(RandomMode::Note)));
        let field = Arc::new(Field::from_rows(&["D........D"; 3]));
        let now = Instant::now();
        let a = Arc::new(Player::new("a", 1, Position::new(0, 0), field.clone(), ran.clone(), now));
        let b = Arc::new(Player::new("b", 2, Position::new(0, 9), field, ran, now));
        a.set_enemies(vec![Arc::downgrade(&b)]);
        b.set_enemies(vec![Arc::downgrade(&a)]);
        vec![a, b]
    }

    #[test]
    fn test_symbols_saturate() {
        assert_eq!(epsp_symbol(1), '1');
        assert_eq!(epsp_symbol(9), '9');
        assert_eq!(epsp_symbol(10), ':');
        assert_eq!(epsp_symbol(40), ':');
        assert_eq!(ipsp_symbol(1), 'a');
        assert_eq!(ipsp_symbol(26), 'z');
        assert_eq!(ipsp_symbol(100), 'z');
    }

    #[test]
    fn test_ipsp_dominates_epsp() {
        let cell = Position::new(2, 2);
        let other = Position::new(3, 3);
        let counts = vec![
            (1, BTreeMap::from([(cell, (7, 0)), (other, (2, 0))])),
            (2, BTreeMap::from([(cell, (0, 1)), (other, (4, 0))])),
        ];
        let stacked = stack_counts(&counts);
        assert_eq!(stacked[&cell], StackedSymbol { symbol: 'a', color: 2 });
        assert_eq!(stacked[&other], StackedSymbol { symbol: '4', color: 2 });
    }

    #[test]
    fn test_equal_stacks_keep_first_seat() {
        let cell = Position::new(0, 5);
        let counts = vec![
            (1, BTreeMap::from([(cell, (0, 3))])),
            (2, BTreeMap::from([(cell, (0, 3))])),
        ];
        assert_eq!(stack_counts(&counts)[&cell].color, 1);
    }

    #[test]
    fn test_empty_board_has_no_stacks() {
        let players = pair();
        assert!(stacked_potentials(&players).is_empty());
        assert!(resolve_collisions(&players).is_empty());
    }
}
