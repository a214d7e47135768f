//! Motion-capture sequences.
//!
//! A `.mocap` datapoint is a JSON array of frames, each frame an array of
//! channel values. Root gait datasets describe which channel columns hold
//! positions and which hold rotations (`position_range`, `rotation_range`).

use std::fs;
use std::ops::Range;
use std::path::Path;

use serde_yaml::Value;

use crate::error::DatasetError;

use super::meta::DatasetMeta;

/// Root metadata key naming the position channel columns.
pub const POSITION_RANGE_KEY: &str = "position_range";
/// Root metadata key naming the rotation channel columns.
pub const ROTATION_RANGE_KEY: &str = "rotation_range";

/// A rectangular frames-by-channels matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSequence {
    frames: Vec<Vec<f64>>,
}

impl MotionSequence {
    /// Builds a sequence, rejecting ragged frames.
    pub fn new(frames: Vec<Vec<f64>>) -> Result<Self, DatasetError> {
        if let Some(first) = frames.first() {
            let width = first.len();
            if let Some(bad) = frames.iter().position(|f| f.len() != width) {
                return Err(DatasetError::InvalidArgument(format!(
                    "frame {} has {} channels, expected {}",
                    bad,
                    frames[bad].len(),
                    width
                )));
            }
        }
        Ok(Self { frames })
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let content = fs::read_to_string(path)?;
        let frames: Vec<Vec<f64>> =
            serde_json::from_str(&content).map_err(|e| DatasetError::InvalidMotion {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::new(frames).map_err(|e| DatasetError::InvalidMotion {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Writes the sequence. A symlinked destination is replaced by a file.
    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let content = serde_json::to_string(&self.frames)?;
        if fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            fs::remove_file(path)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn frames(&self) -> &[Vec<f64>] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.frames
    }

    pub fn into_frames(self) -> Vec<Vec<f64>> {
        self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn channel_count(&self) -> usize {
        self.frames.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Per-channel mean over all frames.
    pub fn mean_frame(&self) -> Vec<f64> {
        let width = self.channel_count();
        if self.frames.is_empty() {
            return Vec::new();
        }
        let mut sums = vec![0.0; width];
        for frame in &self.frames {
            for (sum, v) in sums.iter_mut().zip(frame) {
                *sum += v;
            }
        }
        let n = self.frames.len() as f64;
        sums.into_iter().map(|s| s / n).collect()
    }

    /// Per-channel population standard deviation over all frames.
    pub fn std_frame(&self) -> Vec<f64> {
        let mean = self.mean_frame();
        if self.frames.is_empty() {
            return Vec::new();
        }
        let mut sums = vec![0.0; mean.len()];
        for frame in &self.frames {
            for ((sum, v), m) in sums.iter_mut().zip(frame).zip(&mean) {
                *sum += (v - m).powi(2);
            }
        }
        let n = self.frames.len() as f64;
        sums.into_iter().map(|s| (s / n).sqrt()).collect()
    }

    /// Keeps only the given channel columns.
    pub fn columns(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.channel_count());
        let start = range.start.min(end);
        Self {
            frames: self
                .frames
                .iter()
                .map(|f| f[start..end].to_vec())
                .collect(),
        }
    }
}

/// Column range stored under `key` in the root metadata, as `[start, end]`.
pub fn channel_range(meta: &DatasetMeta, key: &str) -> Option<Range<usize>> {
    let value = meta.root_attribute(key)?;
    let bounds = match value {
        Value::Sequence(items) if items.len() == 2 => items,
        _ => return None,
    };
    let start = bounds[0].as_u64()? as usize;
    let end = bounds[1].as_u64()? as usize;
    (start <= end).then_some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::meta::Modality;
    use tempfile::TempDir;

    #[test]
    fn test_ragged_frames_are_rejected() {
        assert!(MotionSequence::new(vec![vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(MotionSequence::new(Vec::new()).is_ok());
    }

    #[test]
    fn test_load_and_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.1.mocap");
        std::fs::write(&path, "[[1.0, 2.0], [3.0, 4.0]]").unwrap();

        let mut seq = MotionSequence::load(&path).unwrap();
        assert_eq!(seq.frame_count(), 2);
        assert_eq!(seq.channel_count(), 2);

        seq.frames_mut()[0][0] = 10.0;
        seq.save(&path).unwrap();
        let reloaded = MotionSequence::load(&path).unwrap();
        assert_eq!(reloaded.frames()[0][0], 10.0);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.1.mocap");
        std::fs::write(&path, "{not json").unwrap();
        match MotionSequence::load(&path) {
            Err(DatasetError::InvalidMotion { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_statistics() {
        let seq = MotionSequence::new(vec![vec![1.0, 0.0], vec![3.0, 0.0]]).unwrap();
        assert_eq!(seq.mean_frame(), vec![2.0, 0.0]);
        assert_eq!(seq.std_frame(), vec![1.0, 0.0]);
        assert_eq!(seq.columns(1..5).channel_count(), 1);
    }

    #[test]
    fn test_channel_range_from_root_metadata() {
        let mut meta = DatasetMeta::root("mocap", Modality::Gait);
        meta.extra.insert(
            POSITION_RANGE_KEY.to_string(),
            serde_yaml::from_str("[0, 3]").unwrap(),
        );
        assert_eq!(channel_range(&meta, POSITION_RANGE_KEY), Some(0..3));
        assert_eq!(channel_range(&meta, ROTATION_RANGE_KEY), None);
    }
}
