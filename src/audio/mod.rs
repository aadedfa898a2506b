//! Analyzed Audio
//!
//! Read-only stream of beat-aligned feature frames produced by an external
//! analysis step, plus the audio-keyed random generators used for map
//! generation and AI decisions.
//!
//! ## Analysis file
//!
//! ```json
//! {
//!   "source": "songs/track.mp3",
//!   "beats": [
//!     { "time": 0,   "bpm": 120.0, "level": 0.41, "notes": [57, 60, 64], "off_note": false, "minor": true },
//!     { "time": 500, "bpm": 120.0, "level": 0.63, "notes": [59, 62],     "off_note": true,  "minor": true }
//!   ]
//! }
//! ```
//!
//! For a source `foo/bar.mp3` the analysis is read from
//! `<base>/data/analysis/bar.json`; a source ending in `.json` is read
//! directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::rng::{DeterministicRng, derive_audio_seed};

// =============================================================================
// ERRORS
// =============================================================================

/// Errors while loading analyzed audio.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The beat stream is empty.
    #[error("audio unavailable: no analyzed beats for {0}")]
    Unavailable(String),

    /// Analysis file could not be read.
    #[error("failed to read analysis {path}: {source}")]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Analysis file is not valid JSON.
    #[error("failed to parse analysis: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// BEAT FRAME
// =============================================================================

/// One entry of the analysis stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeatFrame {
    /// Offset from the start of the track in milliseconds
    pub time: u64,
    /// Tempo at this beat
    pub bpm: f64,
    /// Loudness in `[0, 1]`
    pub level: f64,
    /// Detected pitches (MIDI note numbers)
    #[serde(default)]
    pub notes: Vec<u8>,
    /// More notes off the current key than on it
    #[serde(default)]
    pub off_note: bool,
    /// Current interval is minor
    #[serde(default)]
    pub minor: bool,
}

impl BeatFrame {
    /// Render period for this beat: 60000 / (bpm * 16) ms.
    pub fn render_period_ms(&self) -> f64 {
        if self.bpm <= 0.0 {
            return 40.0;
        }
        60000.0 / (self.bpm * 16.0)
    }

    fn seed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(24 + self.notes.len());
        bytes.extend_from_slice(&self.time.to_le_bytes());
        bytes.extend_from_slice(&self.bpm.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.level.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.notes);
        bytes.push(self.off_note as u8);
        bytes.push(self.minor as u8);
        bytes
    }
}

#[derive(Deserialize)]
struct AnalysisFile {
    #[serde(default)]
    source: Option<String>,
    beats: Vec<BeatFrame>,
}

// =============================================================================
// ANALYZED AUDIO
// =============================================================================

/// Complete analysis of one track.
#[derive(Clone, Debug)]
pub struct AnalyzedAudio {
    source: String,
    beats: Arc<[BeatFrame]>,
    average_level: f64,
    seed: u64,
}

impl AnalyzedAudio {
    /// Build from frames already in memory.
    pub fn from_frames(source: impl Into<String>, beats: Vec<BeatFrame>) -> Result<Self, AudioError> {
        let source = source.into();
        if beats.is_empty() {
            return Err(AudioError::Unavailable(source));
        }
        let average_level = beats.iter().map(|b| b.level).sum::<f64>() / beats.len() as f64;
        let bytes: Vec<Vec<u8>> = beats.iter().map(BeatFrame::seed_bytes).collect();
        let seed = derive_audio_seed(&source, bytes.iter().map(|b| b.as_slice()));
        debug!(%source, beats = beats.len(), seed = %hex::encode(seed.to_le_bytes()), "analyzed audio ready");
        Ok(Self {
            source,
            beats: beats.into(),
            average_level,
            seed,
        })
    }

    /// Load the analysis for `source_path`.
    pub fn load(source_path: &str, base_path: &Path) -> Result<Self, AudioError> {
        let path = analysis_path(source_path, base_path);
        info!(path = %path.display(), "loading audio analysis");
        let raw = std::fs::read_to_string(&path).map_err(|source| AudioError::Io {
            path: path.clone(),
            source,
        })?;
        let file: AnalysisFile = serde_json::from_str(&raw)?;
        Self::from_frames(file.source.unwrap_or_else(|| source_path.to_string()), file.beats)
    }

    /// Path of the analyzed track.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// File name of the track, optionally without extension.
    pub fn filename(&self, strip_extension: bool) -> String {
        let path = Path::new(&self.source);
        let name = if strip_extension { path.file_stem() } else { path.file_name() };
        name.map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.clone())
    }

    /// All beat frames in order.
    pub fn beats(&self) -> &[BeatFrame] {
        &self.beats
    }

    /// Shared handle on the frames.
    pub fn shared_beats(&self) -> Arc<[BeatFrame]> {
        Arc::clone(&self.beats)
    }

    /// Mean level over the whole track.
    pub fn average_level(&self) -> f64 {
        self.average_level
    }

    /// Seed derived from the frames.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether iron is gained on this beat.
    pub fn more_off_notes(&self, frame: &BeatFrame) -> bool {
        frame.off_note
    }

    /// Random generator keyed to one feature of this track.
    pub fn generator(&self, mode: RandomMode) -> RandomGenerator {
        RandomGenerator::new(self, mode)
    }
}

/// Resolve where the analysis for a source lives.
pub fn analysis_path(source_path: &str, base_path: &Path) -> PathBuf {
    let source = Path::new(source_path);
    if source.extension().map_or(false, |e| e == "json") {
        return source.to_path_buf();
    }
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_path.to_string());
    base_path.join("data").join("analysis").join(format!("{stem}.json"))
}

// =============================================================================
// RANDOM GENERATOR
// =============================================================================

/// Which beat feature a generator mixes into its draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomMode {
    /// Sum of detected notes
    Note,
    /// Minor/major flag of the interval
    MinorInterval,
    /// Level relative to the track average
    LevelPeaks,
}

/// Random source driven by the analysis stream.
///
/// Each draw consumes one frame (cycling) and mixes its feature into a
/// seeded PRNG, so the same track always yields the same sequence.
#[derive(Clone, Debug)]
pub struct RandomGenerator {
    beats: Arc<[BeatFrame]>,
    mode: RandomMode,
    average_level: f64,
    cursor: usize,
    rng: DeterministicRng,
}

impl RandomGenerator {
    /// Create a generator over a track.
    pub fn new(audio: &AnalyzedAudio, mode: RandomMode) -> Self {
        let salt = match mode {
            RandomMode::Note => 0x4E4F_5445,
            RandomMode::MinorInterval => 0x4D49_4E4F,
            RandomMode::LevelPeaks => 0x5045_414B,
        };
        Self {
            beats: audio.shared_beats(),
            mode,
            average_level: audio.average_level(),
            cursor: 0,
            rng: DeterministicRng::new(audio.seed() ^ salt),
        }
    }

    /// Feature mode of this generator.
    pub fn mode(&self) -> RandomMode {
        self.mode
    }

    fn next_feature(&mut self) -> u64 {
        let Some(frame) = self.beats.get(self.cursor % self.beats.len().max(1)) else {
            return 0;
        };
        self.cursor = self.cursor.wrapping_add(1);
        match self.mode {
            RandomMode::Note => frame.notes.iter().map(|&n| n as u64).sum(),
            RandomMode::MinorInterval => frame.minor as u64,
            RandomMode::LevelPeaks => {
                let above = frame.level > self.average_level;
                ((frame.level * 1000.0) as u64) << 1 | above as u64
            }
        }
    }

    fn next_mixed(&mut self) -> u64 {
        let feature = self.next_feature();
        self.rng.next_u64() ^ feature.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    /// Integer in `[min, max)`; `min` when the range is empty.
    pub fn random_int(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        let span = (max as i64 - min as i64) as u64;
        (min as i64 + (self.next_mixed() % span) as i64) as i32
    }

    /// Fair boolean.
    pub fn random_bool(&mut self) -> bool {
        self.next_mixed() & 1 == 1
    }

    /// Index into `weights`, chosen proportionally. `None` if all weights are zero.
    pub fn pick_weighted(&mut self, weights: &[u32]) -> Option<usize> {
        let total: u64 = weights.iter().map(|&w| w as u64).sum();
        if total == 0 {
            return None;
        }
        let mut roll = self.next_mixed() % total;
        for (i, &w) in weights.iter().enumerate() {
            if roll < w as u64 {
                return Some(i);
            }
            roll -= w as u64;
        }
        None
    }

    /// Pick one element uniformly.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.random_int(0, items.len() as i32) as usize;
        items.get(idx)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn synthetic(n: usize, seed: u64) -> Vec<BeatFrame> {
        let mut r = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| BeatFrame {
                time: i as u64 * 500,
                bpm: 120.0,
                level: r.gen_range(0.0..1.0),
                notes: (0..3).map(|_| r.gen_range(48..72)).collect(),
                off_note: r.gen_bool(0.3),
                minor: r.gen_bool(0.5),
            })
            .collect()
    }

    #[test]
    fn test_empty_stream_is_unavailable() {
        let err = AnalyzedAudio::from_frames("empty.mp3", vec![]).unwrap_err();
        assert!(matches!(err, AudioError::Unavailable(_)));
    }

    #[test]
    fn test_generators_are_reproducible() {
        let audio = AnalyzedAudio::from_frames("a.mp3", synthetic(32, 7)).unwrap();
        let mut g1 = audio.generator(RandomMode::Note);
        let mut g2 = audio.generator(RandomMode::Note);
        for _ in 0..200 {
            assert_eq!(g1.random_int(0, 50), g2.random_int(0, 50));
        }
    }

    #[test]
    fn test_random_int_bounds() {
        let audio = AnalyzedAudio::from_frames("b.mp3", synthetic(16, 3)).unwrap();
        let mut g = audio.generator(RandomMode::LevelPeaks);
        for _ in 0..500 {
            let v = g.random_int(-3, 4);
            assert!((-3..4).contains(&v));
        }
        assert_eq!(g.random_int(5, 5), 5);
    }

    #[test]
    fn test_pick_weighted_skips_zero_weights() {
        let audio = AnalyzedAudio::from_frames("c.mp3", synthetic(8, 11)).unwrap();
        let mut g = audio.generator(RandomMode::MinorInterval);
        for _ in 0..100 {
            assert_eq!(g.pick_weighted(&[0, 5, 0]), Some(1));
        }
        assert_eq!(g.pick_weighted(&[0, 0]), None);
    }

    #[test]
    fn test_render_period() {
        let frame = BeatFrame { time: 0, bpm: 125.0, level: 0.5, notes: vec![], off_note: false, minor: false };
        assert_eq!(frame.render_period_ms(), 30.0);
    }

    #[test]
    fn test_analysis_path() {
        let base = Path::new("/home/x/.dissonance");
        assert_eq!(
            analysis_path("/music/song.mp3", base),
            PathBuf::from("/home/x/.dissonance/data/analysis/song.json")
        );
        assert_eq!(analysis_path("/tmp/a.json", base), PathBuf::from("/tmp/a.json"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.json");
        std::fs::write(
            &path,
            r#"{"source":"track.mp3","beats":[{"time":0,"bpm":100.0,"level":0.2},{"time":600,"bpm":100.0,"level":0.8,"off_note":true}]}"#,
        )
        .unwrap();
        let audio = AnalyzedAudio::load(path.to_str().unwrap(), dir.path()).unwrap();
        assert_eq!(audio.beats().len(), 2);
        assert_eq!(audio.filename(true), "track");
        assert!((audio.average_level() - 0.5).abs() < 1e-9);
        assert!(audio.more_off_notes(&audio.beats()[1]));
    }
}
