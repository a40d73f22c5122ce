//! Episode-indexed dataset with delta-timestamp frame queries.

use crate::delta::{check_delta_timestamps, delta_indices, DeltaIndices, DeltaTimestamps, DEFAULT_TOLERANCE_S};
use crate::features::camera_chw;
use crate::frames::{ColumnSelection, FrameTable, EPISODE_INDEX, FRAME_INDEX, INDEX, TIMESTAMP};
use crate::metadata::DatasetMetadata;
use crate::types::{DatasetError, DatasetResult, FrameStack, ImageStack, Sample};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;

const NON_FEATURE_COLUMNS: [&str; 5] = [EPISODE_INDEX, FRAME_INDEX, INDEX, TIMESTAMP, "task_index"];

pub struct LeRobotDataset {
    meta: DatasetMetadata,
    delta_indices: DeltaIndices,
    frames: FrameTable,
    episodes: Vec<usize>,
    /// Row range of each loaded episode inside `frames`.
    episode_ranges: BTreeMap<usize, Range<usize>>,
    /// `(c, h, w)` for every decoded image feature.
    image_shapes: BTreeMap<String, [usize; 3]>,
    tolerance_s: f32,
}

impl std::fmt::Debug for LeRobotDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeRobotDataset")
            .field("repo_id", &self.meta.repo_id)
            .field("episodes", &self.episodes.len())
            .field("frames", &self.frames.len())
            .field("delta_indices", &self.delta_indices)
            .finish()
    }
}

impl LeRobotDataset {
    /// Load the episodes (all when `episodes` is `None`) and validate `delta_timestamps`.
    pub fn open(
        meta: DatasetMetadata,
        delta_timestamps: Option<DeltaTimestamps>,
        episodes: Option<&[usize]>,
    ) -> DatasetResult<Self> {
        Self::open_with_tolerance(meta, delta_timestamps, episodes, DEFAULT_TOLERANCE_S)
    }

    pub fn open_with_tolerance(
        meta: DatasetMetadata,
        delta_timestamps: Option<DeltaTimestamps>,
        episodes: Option<&[usize]>,
        tolerance_s: f32,
    ) -> DatasetResult<Self> {
        let fps = meta.fps();
        let delta_timestamps = delta_timestamps.unwrap_or_default();
        for key in delta_timestamps.keys() {
            let ft = meta
                .features()
                .get(key)
                .ok_or_else(|| DatasetError::UnknownFeature(key.clone()))?;
            if ft.is_video() {
                return Err(DatasetError::Other(format!(
                    "feature {key} is video-backed; video decoding is not supported"
                )));
            }
        }
        check_delta_timestamps(&delta_timestamps, fps, tolerance_s)?;
        let delta_indices = delta_indices(&delta_timestamps, fps);

        let mut selection = ColumnSelection::default();
        let mut image_shapes = BTreeMap::new();
        for (key, ft) in meta.features() {
            if ft.is_video() {
                tracing::debug!(feature = %key, "skipping video-backed feature");
                continue;
            }
            if ft.is_camera() {
                let [c, h, w] = camera_chw(key, ft)?;
                if c != 1 && c != 3 {
                    return Err(DatasetError::Other(format!(
                        "image feature {key} has {c} channels; expected 1 or 3"
                    )));
                }
                selection.images.push(key.clone());
                image_shapes.insert(key.clone(), [c, h, w]);
                continue;
            }
            if NON_FEATURE_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            if matches!(ft.dtype.as_str(), "float32" | "float64" | "int64" | "int32") {
                selection.vectors.push((key.clone(), ft.numel()));
            }
        }

        let episodes: Vec<usize> = match episodes {
            Some(list) => list.to_vec(),
            None => meta.episode_indices(),
        };
        if episodes.is_empty() {
            return Err(DatasetError::Other(format!(
                "dataset {} has no episodes to load",
                meta.repo_id
            )));
        }

        let mut frames = FrameTable::default();
        for &ep in &episodes {
            let path = meta.episode_data_path(ep)?;
            let table = FrameTable::read_parquet(&path, &selection)?;
            if table.episode_index.iter().any(|e| *e != ep) {
                return Err(DatasetError::Validation {
                    path,
                    msg: format!("file contains rows from episodes other than {ep}"),
                });
            }
            frames.extend(table);
        }
        frames.check_timestamps_sync(fps, tolerance_s)?;
        let episode_ranges = episode_ranges(&frames.episode_index);

        tracing::info!(
            repo_id = %meta.repo_id,
            episodes = episodes.len(),
            frames = frames.len(),
            "dataset loaded"
        );
        Ok(Self {
            meta,
            delta_indices,
            frames,
            episodes,
            episode_ranges,
            image_shapes,
            tolerance_s,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn num_episodes(&self) -> usize {
        self.episodes.len()
    }

    pub fn fps(&self) -> f32 {
        self.meta.fps()
    }

    pub fn meta(&self) -> &DatasetMetadata {
        &self.meta
    }

    pub fn delta_indices(&self) -> &DeltaIndices {
        &self.delta_indices
    }

    pub fn tolerance_s(&self) -> f32 {
        self.tolerance_s
    }

    /// Row ranges per episode, in load order.
    pub fn episode_ranges(&self) -> impl Iterator<Item = (usize, Range<usize>)> + '_ {
        self.episodes
            .iter()
            .filter_map(|ep| self.episode_ranges.get(ep).map(|r| (*ep, r.clone())))
    }

    pub fn get(&self, idx: usize) -> DatasetResult<Sample> {
        if idx >= self.len() {
            return Err(DatasetError::Other(format!(
                "index {idx} out of range for dataset of {} frames",
                self.len()
            )));
        }
        let episode_index = self.frames.episode_index[idx];
        let range = self
            .episode_ranges
            .get(&episode_index)
            .cloned()
            .unwrap_or(idx..idx + 1);

        let mut is_pad = BTreeMap::new();
        let mut query_rows = |key: &str| -> Vec<usize> {
            match self.delta_indices.get(key) {
                Some(deltas) => {
                    let (rows, pads) = query_positions(idx, deltas, &range);
                    is_pad.insert(key.to_string(), pads);
                    rows
                }
                None => vec![idx],
            }
        };

        let mut vectors = BTreeMap::new();
        for (key, col) in &self.frames.vectors {
            let rows = query_rows(key);
            let mut data = Vec::with_capacity(rows.len() * col.dim);
            for r in &rows {
                data.extend_from_slice(col.row(*r));
            }
            vectors.insert(
                key.clone(),
                FrameStack {
                    frames: rows.len(),
                    dim: col.dim,
                    data,
                },
            );
        }

        let mut images = BTreeMap::new();
        for (key, encoded) in &self.frames.images {
            let [c, h, w] = self.image_shapes[key];
            let rows = query_rows(key);
            let mut data = Vec::with_capacity(rows.len() * c * h * w);
            for r in &rows {
                decode_chw(&encoded[*r], c, h, w, &mut data).map_err(|source| {
                    DatasetError::Image {
                        path: PathBuf::from(format!("{key}[{r}]")),
                        source,
                    }
                })?;
            }
            images.insert(
                key.clone(),
                ImageStack {
                    frames: rows.len(),
                    channels: c,
                    height: h,
                    width: w,
                    data,
                },
            );
        }

        Ok(Sample {
            index: self.frames.index[idx],
            episode_index,
            vectors,
            images,
            is_pad,
        })
    }
}

/// Rows for `idx + d`, clamped to the episode; pad flags mark clamped queries.
fn query_positions(idx: usize, deltas: &[i64], range: &Range<usize>) -> (Vec<usize>, Vec<bool>) {
    let lo = range.start as i64;
    let hi = range.end as i64 - 1;
    deltas
        .iter()
        .map(|d| {
            let q = idx as i64 + d;
            (q.clamp(lo, hi) as usize, q < lo || q > hi)
        })
        .unzip()
}

fn episode_ranges(episode_index: &[usize]) -> BTreeMap<usize, Range<usize>> {
    let mut ranges: BTreeMap<usize, Range<usize>> = BTreeMap::new();
    for (row, ep) in episode_index.iter().enumerate() {
        ranges
            .entry(*ep)
            .and_modify(|r| r.end = row + 1)
            .or_insert(row..row + 1);
    }
    ranges
}

fn decode_chw(
    bytes: &[u8],
    channels: usize,
    height: usize,
    width: usize,
    out: &mut Vec<f32>,
) -> Result<(), image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let img = if img.width() as usize != width || img.height() as usize != height {
        img.resize_exact(
            width as u32,
            height as u32,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };
    if channels == 1 {
        let gray = img.to_luma8();
        out.extend(gray.as_raw().iter().map(|v| *v as f32 / 255.0));
        return Ok(());
    }
    let rgb = img.to_rgb8();
    let raw = rgb.as_raw();
    for c in 0..3 {
        out.extend(raw.iter().skip(c).step_by(3).map(|v| *v as f32 / 255.0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_are_clamped_and_padded_at_episode_edges() {
        let range = 10..15;
        let (rows, pads) = query_positions(10, &[-1, 0, 1], &range);
        assert_eq!(rows, vec![10, 10, 11]);
        assert_eq!(pads, vec![true, false, false]);

        let (rows, pads) = query_positions(14, &[0, 1, 2], &range);
        assert_eq!(rows, vec![14, 14, 14]);
        assert_eq!(pads, vec![false, true, true]);
    }

    #[test]
    fn ranges_follow_contiguous_episode_runs() {
        let ranges = episode_ranges(&[3, 3, 3, 7, 7]);
        assert_eq!(ranges[&3], 0..3);
        assert_eq!(ranges[&7], 3..5);
    }

    #[test]
    fn rgb_is_decoded_channel_first() {
        let img = image::RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let mut out = Vec::new();
        decode_chw(&png, 3, 1, 2, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
