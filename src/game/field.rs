//! Field
//!
//! The grid every game is played on: hill layout, the walkable graph,
//! section partitioning, nucleus/resource placement and path queries.
//!
//! Topology (hills, graph) is fixed once setup finishes. Cell symbols still
//! change as neurons are built and destroyed, so they sit behind their own
//! lock, which is always the last one taken.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::audio::RandomGenerator;
use crate::core::Position;
use crate::core::sync::{read, write};
use crate::game::costs::{UnitKind, SYMBOL_FREE, SYMBOL_HILL, SYMBOL_NUCLEUS};
use crate::game::error::{GameError, GameResult};
use crate::game::graph::Graph;
use crate::game::resource::ResourceKind;

/// Number of sections the field is split into (4 columns x 2 rows).
pub const SECTIONS: usize = 8;
/// Field construction attempts before the map counts as unplayable.
pub const MAX_DENSENESS: i32 = 3;

/// Radius cleared around a new nucleus.
const NUCLEUS_CLEAR_RADIUS: f64 = 1.5;
/// Resource annulus around a nucleus.
const RESOURCE_MIN_DIST: f64 = 2.0;
const RESOURCE_MAX_DIST: f64 = 4.0;

// =============================================================================
// VIEW OVERLAY
// =============================================================================

/// Transient view hints: highlighted cells, symbol overrides, range display.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// Cells drawn highlighted
    pub highlight: Vec<Position>,
    /// Symbol overrides
    pub replacements: BTreeMap<Position, char>,
    /// Center of the displayed range
    pub range_center: Option<Position>,
    /// Radius of the displayed range
    pub range: f64,
}

// =============================================================================
// FIELD
// =============================================================================

/// Game grid of `lines x cols` cells.
#[derive(Debug)]
pub struct Field {
    lines: i32,
    cols: i32,
    cells: RwLock<Vec<char>>,
    graph: Graph,
    overlay: RwLock<Overlay>,
}

impl Field {
    /// All-free field.
    pub fn new(lines: i32, cols: i32) -> Self {
        let lines = lines.max(1);
        let cols = cols.max(1);
        Self {
            lines,
            cols,
            cells: RwLock::new(vec![SYMBOL_FREE; (lines * cols) as usize]),
            graph: Graph::default(),
            overlay: RwLock::new(Overlay::default()),
        }
    }

    /// Field from literal rows; any char is kept as-is. Builds the graph.
    pub fn from_rows(rows: &[&str]) -> Self {
        let lines = rows.len() as i32;
        let cols = rows.iter().map(|r| r.chars().count()).max().unwrap_or(0) as i32;
        let mut field = Self::new(lines, cols);
        for (l, row) in rows.iter().enumerate() {
            for (c, ch) in row.chars().enumerate() {
                field.set_cell_mut(Position::new(l as i32, c as i32), ch);
            }
        }
        field.build_graph();
        field
    }

    /// Number of rows.
    pub fn lines(&self) -> i32 {
        self.lines
    }

    /// Number of columns.
    pub fn cols(&self) -> i32 {
        self.cols
    }

    /// Walkable graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Inside the grid?
    #[inline]
    pub fn in_field(&self, pos: Position) -> bool {
        pos.row >= 0 && pos.row < self.lines && pos.col >= 0 && pos.col < self.cols
    }

    #[inline]
    fn index(&self, pos: Position) -> Option<usize> {
        self.in_field(pos).then(|| (pos.row * self.cols + pos.col) as usize)
    }

    fn set_cell_mut(&mut self, pos: Position, symbol: char) {
        if let Some(idx) = self.index(pos) {
            let cells = self.cells.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
            cells[idx] = symbol;
        }
    }

    /// Symbol at `pos`.
    pub fn symbol_at(&self, pos: Position) -> Option<char> {
        let idx = self.index(pos)?;
        read(&self.cells).get(idx).copied()
    }

    /// Cell holds the free symbol.
    pub fn is_free(&self, pos: Position) -> bool {
        self.symbol_at(pos) == Some(SYMBOL_FREE)
    }

    /// Resource whose symbol sits at `pos`.
    pub fn resource_at(&self, pos: Position) -> Option<ResourceKind> {
        self.symbol_at(pos).and_then(ResourceKind::from_symbol)
    }

    // =========================================================================
    // GENERATION
    // =========================================================================

    /// Scatter `2 * (lines + cols)` hill seeds, each growing five more cells.
    ///
    /// `sign` decides the displacement direction, `magnitude` its size and
    /// the seed cells. Displacement for the j-th cell is drawn from
    /// `[denseness, j + denseness]`.
    pub fn add_hills(&mut self, sign: &mut RandomGenerator, magnitude: &mut RandomGenerator, denseness: i32) {
        let num_hills = 2 * (self.lines + self.cols);
        for _ in 0..num_hills {
            let start = Position::new(
                magnitude.random_int(0, self.lines),
                magnitude.random_int(0, self.cols),
            );
            self.set_cell_mut(start, SYMBOL_HILL);
            for j in 1..=5 {
                let mut shift = |x: i32, max: i32| {
                    let amount = magnitude.random_int(denseness, j + denseness + 1);
                    let moved = if sign.random_bool() { x + amount } else { x - amount };
                    moved.clamp(0, max - 1)
                };
                let pos = Position::new(shift(start.row, self.lines), shift(start.col, self.cols));
                self.set_cell_mut(pos, SYMBOL_HILL);
            }
        }
        debug!(denseness, "hills added");
    }

    /// Rebuild the graph from every non-hill cell.
    pub fn build_graph(&mut self) {
        let cells = self.cells.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        let cols = self.cols;
        self.graph = Graph::build(self.lines, self.cols, |p| {
            cells[(p.row * cols + p.col) as usize] != SYMBOL_HILL
        });
    }

    /// Place one nucleus at `pos`: clear its neighbourhood and seed the
    /// five field resources in the 2-4 annulus.
    pub fn place_nucleus(&mut self, pos: Position, ran: &mut RandomGenerator) -> GameResult<()> {
        if !self.in_field(pos) {
            return Err(GameError::InvalidPlacement(pos));
        }
        self.set_cell_mut(pos, SYMBOL_NUCLEUS);
        for near in self.cells_in_range(pos, NUCLEUS_CLEAR_RADIUS, 1.0) {
            self.set_cell_mut(near, SYMBOL_FREE);
        }

        let mut candidates: Vec<Position> = self
            .cells_in_range(pos, RESOURCE_MAX_DIST, RESOURCE_MIN_DIST)
            .into_iter()
            .filter(|p| self.is_free(*p))
            .collect();
        for kind in ResourceKind::ON_FIELD {
            if candidates.is_empty() {
                return Err(GameError::InvalidPlacement(pos));
            }
            let idx = ran.random_int(0, candidates.len() as i32) as usize;
            let cell = candidates.swap_remove(idx);
            if let Some(symbol) = kind.symbol() {
                self.set_cell_mut(cell, symbol);
            }
        }
        debug!(%pos, "nucleus placed");
        Ok(())
    }

    /// Place one nucleus per player in well separated sections.
    ///
    /// Returns only the nuclei that ended up in the (pruned) graph; fewer
    /// than `num_players` means the map is unplayable.
    pub fn add_nuclei(&mut self, num_players: usize, ran: &mut RandomGenerator) -> Vec<Position> {
        let mut placed = Vec::with_capacity(num_players);
        for section in self.section_order(ran).into_iter().take(num_players) {
            match self.pick_in_section(section, ran) {
                Ok(pos) => match self.place_nucleus(pos, ran) {
                    Ok(()) => placed.push(pos),
                    Err(e) => warn!(section, error = %e, "nucleus placement failed"),
                },
                Err(e) => warn!(error = %e, "nucleus placement failed"),
            }
        }
        self.finalize_graph(&placed)
    }

    /// Rebuild the graph, prune it to the first nucleus and return the
    /// nuclei that are still part of it.
    pub fn finalize_graph(&mut self, nuclei: &[Position]) -> Vec<Position> {
        self.build_graph();
        let Some(first) = nuclei.first() else {
            return Vec::new();
        };
        self.graph.prune_to_component(*first);
        nuclei.iter().copied().filter(|p| self.graph.contains(*p)).collect()
    }

    fn pick_in_section(&self, section: usize, ran: &mut RandomGenerator) -> GameResult<Position> {
        let candidates: Vec<Position> = self
            .positions_of_section(section)
            .into_iter()
            .filter(|p| self.graph.contains(*p))
            .collect();
        ran.choose(&candidates).copied().ok_or(GameError::EmptySection(section))
    }

    /// Section order: random start, its diagonal opposite, then the rest
    /// farthest-first from the sections already chosen.
    pub fn section_order(&self, ran: &mut RandomGenerator) -> Vec<usize> {
        let centers = self.center_positions_of_sections();
        let start = ran.random_int(0, SECTIONS as i32) as usize;
        let (row, col) = (start / 4, start % 4);
        let opposite = (1 - row) * 4 + (3 - col);
        let mut order = vec![start, opposite];
        while order.len() < SECTIONS {
            let next = (0..SECTIONS)
                .filter(|s| !order.contains(s))
                .max_by(|a, b| {
                    let da = min_distance(centers[*a], order.iter().map(|s| centers[*s]));
                    let db = min_distance(centers[*b], order.iter().map(|s| centers[*s]));
                    // Lower index wins ties.
                    da.total_cmp(&db).then(b.cmp(a))
                });
            match next {
                Some(s) => order.push(s),
                None => break,
            }
        }
        order
    }

    /// All cells of a section (0..8, row-major over 2 x 4 blocks).
    pub fn positions_of_section(&self, section: usize) -> Vec<Position> {
        let (h, w) = (self.lines / 2, self.cols / 4);
        let (row, col) = ((section / 4) as i32, (section % 4) as i32);
        let mut positions = Vec::with_capacity((h * w).max(0) as usize);
        for l in row * h..(row + 1) * h {
            for c in col * w..(col + 1) * w {
                positions.push(Position::new(l, c));
            }
        }
        positions
    }

    /// Center cell of every section.
    pub fn center_positions_of_sections(&self) -> Vec<Position> {
        let (h, w) = (self.lines / 2, self.cols / 4);
        (0..SECTIONS)
            .map(|s| {
                let (row, col) = ((s / 4) as i32, (s % 4) as i32);
                Position::new(row * h + h / 2, col * w + w / 2)
            })
            .collect()
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    fn cells_in_range(&self, center: Position, max_dist: f64, min_dist: f64) -> Vec<Position> {
        let r = max_dist.ceil() as i32;
        let mut positions = Vec::new();
        for l in center.row - r..=center.row + r {
            for c in center.col - r..=center.col + r {
                let pos = Position::new(l, c);
                if self.in_field(pos) && pos.in_range(center, min_dist, max_dist) {
                    positions.push(pos);
                }
            }
        }
        positions
    }

    /// In-graph cells whose distance to `center` lies in `[min, max]`.
    pub fn all_in_range(&self, center: Position, max_dist: f64, min_dist: f64, free_only: bool) -> Vec<Position> {
        let cells = read(&self.cells);
        self.cells_in_range(center, max_dist, min_dist)
            .into_iter()
            .filter(|p| self.graph.contains(*p))
            .filter(|p| {
                !free_only
                    || self.index(*p).and_then(|i| cells.get(i)) == Some(&SYMBOL_FREE)
            })
            .collect()
    }

    /// Path for a potential from `start` through `way_points`.
    ///
    /// The last way-point is the target; the others are visited farthest
    /// from the target first. The join cell of two legs appears once and
    /// `start` is the first element.
    pub fn get_way_for_soldier(&self, start: Position, way_points: &[Position]) -> GameResult<Vec<Position>> {
        let Some((&target, rest)) = way_points.split_last() else {
            return Err(GameError::NoPath(start, start));
        };
        let mut sorted: Vec<Position> = rest.to_vec();
        sorted.sort_by(|a, b| b.distance(target).total_cmp(&a.distance(target)));
        sorted.push(target);

        let mut way = vec![start];
        let mut cur = start;
        for next in sorted {
            let leg = self.graph.find_way(cur, next).ok_or(GameError::NoPath(cur, next))?;
            way.extend(leg.into_iter().skip(1));
            cur = next;
        }
        Ok(way)
    }

    /// Write a neuron's symbol at `pos`.
    pub fn add_new_unit_to_pos(&self, pos: Position, unit: UnitKind) {
        let Some(symbol) = unit.field_symbol() else {
            return;
        };
        if let Some(idx) = self.index(pos) {
            write(&self.cells)[idx] = symbol;
        }
    }

    /// Clear a destroyed neuron's symbol; resource cells keep theirs.
    pub fn remove_unit_at(&self, pos: Position) {
        if let Some(idx) = self.index(pos) {
            let mut cells = write(&self.cells);
            if ResourceKind::from_symbol(cells[idx]).is_none() && cells[idx] != SYMBOL_HILL {
                cells[idx] = SYMBOL_FREE;
            }
        }
    }

    /// Rows as strings with overlay replacements applied.
    pub fn export(&self) -> Vec<String> {
        let cells = read(&self.cells);
        let overlay = read(&self.overlay);
        (0..self.lines)
            .map(|l| {
                (0..self.cols)
                    .map(|c| {
                        let pos = Position::new(l, c);
                        overlay
                            .replacements
                            .get(&pos)
                            .copied()
                            .unwrap_or(cells[(l * self.cols + c) as usize])
                    })
                    .collect()
            })
            .collect()
    }

    /// Every graph node.
    pub fn graph_positions(&self) -> Vec<Position> {
        self.graph.nodes().collect()
    }

    /// Current view overlay.
    pub fn overlay(&self) -> Overlay {
        read(&self.overlay).clone()
    }

    /// Replace the highlighted cells.
    pub fn set_highlight(&self, positions: Vec<Position>) {
        write(&self.overlay).highlight = positions;
    }

    /// Replace the symbol overrides.
    pub fn set_replacements(&self, replacements: BTreeMap<Position, char>) {
        write(&self.overlay).replacements = replacements;
    }

    /// Set the displayed range.
    pub fn set_range(&self, center: Position, range: f64) {
        let mut overlay = write(&self.overlay);
        overlay.range_center = Some(center);
        overlay.range = range;
    }
}

fn min_distance(pos: Position, others: impl Iterator<Item = Position>) -> f64 {
    others.map(|o| pos.distance(o)).fold(f64::INFINITY, f64::min)
}

// =============================================================================
// PLAYABLE FIELD
// =============================================================================

/// Retry field construction with increasing denseness.
///
/// `attempt` builds a field at the given denseness and returns the nuclei
/// it managed to place. The first attempt placing `num_players` nuclei
/// wins; otherwise the map is unplayable.
pub fn build_playable_field<F>(num_players: usize, mut attempt: F) -> GameResult<(Field, Vec<Position>)>
where
    F: FnMut(i32) -> GameResult<(Field, Vec<Position>)>,
{
    for denseness in 0..MAX_DENSENESS {
        match attempt(denseness) {
            Ok((field, nuclei)) if nuclei.len() >= num_players => {
                info!(denseness, ?nuclei, "map created");
                return Ok((field, nuclei));
            }
            Ok((_, nuclei)) => {
                warn!(denseness, placed = nuclei.len(), num_players, "map unplayable, retrying");
            }
            Err(e) => warn!(denseness, error = %e, "map construction failed, retrying"),
        }
    }
    Err(GameError::UnplayableMap)
}

/// Generate a field from the map audio.
///
/// `ran` (note-keyed) picks sections and cells; `sign` and `magnitude`
/// shape the hills.
pub fn generate_field(
    lines: i32,
    cols: i32,
    num_players: usize,
    ran: &mut RandomGenerator,
    sign: &mut RandomGenerator,
    magnitude: &mut RandomGenerator,
) -> GameResult<(Field, Vec<Position>)> {
    build_playable_field(num_players, |denseness| {
        let mut field = Field::new(lines, cols);
        field.add_hills(sign, magnitude, denseness);
        field.build_graph();
        let nuclei = field.add_nuclei(num_players, ran);
        Ok((field, nuclei))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AnalyzedAudio, BeatFrame, RandomMode};

    fn audio() -> AnalyzedAudio {
        let beats = (0..64)
            .map(|i| BeatFrame {
                time: i * 500,
                bpm: 120.0,
                level: (i % 7) as f64 / 7.0,
                notes: vec![(48 + i % 24) as u8],
                off_note: i % 3 == 0,
                minor: i % 5 < 2,
            })
            .collect();
        AnalyzedAudio::from_frames("field-test.mp3", beats).unwrap()
    }

    #[test]
    fn test_sections_cover_grid() {
        let field = Field::new(20, 40);
        let total: usize = (0..SECTIONS).map(|s| field.positions_of_section(s).len()).sum();
        assert_eq!(total, 20 * 40);
        assert_eq!(field.center_positions_of_sections()[0], Position::new(5, 5));
    }

    #[test]
    fn test_section_order_starts_with_opposites() {
        let field = Field::new(20, 40);
        let mut ran = audio().generator(RandomMode::Note);
        let order = field.section_order(&mut ran);
        assert_eq!(order.len(), SECTIONS);
        let (row, col) = (order[0] / 4, order[0] % 4);
        assert_eq!(order[1], (1 - row) * 4 + (3 - col));
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, (0..SECTIONS).collect::<Vec<_>>());
    }

    #[test]
    fn test_place_nucleus_seeds_five_resources() {
        let mut field = Field::new(30, 30);
        field.build_graph();
        let mut ran = audio().generator(RandomMode::Note);
        let pos = Position::new(15, 15);
        field.place_nucleus(pos, &mut ran).unwrap();
        assert_eq!(field.symbol_at(pos), Some(SYMBOL_NUCLEUS));
        let mut found = Vec::new();
        for cell in field.cells_in_range(pos, 4.0, 2.0) {
            if let Some(kind) = field.resource_at(cell) {
                found.push(kind);
            }
        }
        found.sort();
        assert_eq!(found, ResourceKind::ON_FIELD.to_vec());
    }

    #[test]
    fn test_generated_field_is_playable() {
        let a = audio();
        let mut ran = a.generator(RandomMode::Note);
        let mut sign = a.generator(RandomMode::MinorInterval);
        let mut mag = a.generator(RandomMode::LevelPeaks);
        match generate_field(40, 80, 2, &mut ran, &mut sign, &mut mag) {
            Ok((field, nuclei)) => {
                assert_eq!(nuclei.len(), 2);
                for n in &nuclei {
                    assert!(field.graph().contains(*n));
                    assert_eq!(field.symbol_at(*n), Some(SYMBOL_NUCLEUS));
                }
                let way = field.get_way_for_soldier(nuclei[0], &[nuclei[1]]).unwrap();
                assert_eq!(way.first(), Some(&nuclei[0]));
                assert_eq!(way.last(), Some(&nuclei[1]));
            }
            Err(e) => assert_eq!(e, GameError::UnplayableMap),
        }
    }

    #[test]
    fn test_way_points_farthest_first() {
        let field = Field::from_rows(&[
            "..........",
            "..........",
            "..........",
            "..........",
            "..........",
        ]);
        let start = Position::new(0, 0);
        let target = Position::new(0, 9);
        let near = Position::new(4, 8);
        let far = Position::new(4, 1);
        let way = field.get_way_for_soldier(start, &[near, far, target]).unwrap();
        let i_far = way.iter().position(|p| *p == far).unwrap();
        let i_near = way.iter().position(|p| *p == near).unwrap();
        assert!(i_far < i_near);
        assert_eq!(way.iter().filter(|p| **p == far).count(), 1);
        for pair in way.windows(2) {
            assert!(pair[0].is_adjacent(pair[1]));
        }
    }

    #[test]
    fn test_no_path_across_wall() {
        let field = Field::from_rows(&["..^..", "..^..", "..^.."]);
        let err = field.get_way_for_soldier(Position::new(0, 0), &[Position::new(0, 4)]).unwrap_err();
        assert!(matches!(err, GameError::NoPath(_, _)));
    }

    #[test]
    fn test_unit_symbols_round_trip() {
        let field = Field::from_rows(&["...", ".k.", "..."]);
        let p = Position::new(0, 0);
        field.add_new_unit_to_pos(p, UnitKind::Synapse);
        assert_eq!(field.symbol_at(p), Some('S'));
        field.remove_unit_at(p);
        assert!(field.is_free(p));
        field.remove_unit_at(Position::new(1, 1));
        assert_eq!(field.symbol_at(Position::new(1, 1)), Some('k'));
        assert_eq!(field.export()[1], ".k.");
    }

    #[test]
    fn test_all_in_range_free_only() {
        let field = Field::from_rows(&[".....", ".....", "..D..", ".....", "....."]);
        let center = Position::new(2, 2);
        let all = field.all_in_range(center, 1.5, 0.0, false);
        let free = field.all_in_range(center, 1.5, 0.0, true);
        assert_eq!(all.len(), 9);
        assert_eq!(free.len(), 8);
    }

    #[test]
    fn test_build_playable_field_gives_up() {
        let mut attempts = Vec::new();
        let result = build_playable_field(2, |d| {
            attempts.push(d);
            Ok((Field::new(4, 4), vec![Position::new(0, 0)]))
        });
        assert_eq!(result.unwrap_err(), GameError::UnplayableMap);
        assert_eq!(attempts, vec![0, 1, 2]);
    }
}
