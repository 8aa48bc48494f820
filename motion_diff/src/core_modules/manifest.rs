// THEORY:
// The `Manifest` is the ordered list of frame file names a pass works on. It is
// built once, on the coordinator endpoint, and then distributed so every endpoint
// holds an identical, read-only copy. Frame indices everywhere else in the crate
// (work ranges, transfer ids, diff results) are positions in this list.
//
// Ordering is by the number embedded in the file name, not by string order, so
// `frame_2.png` comes before `frame_10.png`. The key is obtained by dropping every
// non-digit character, which matches the `frame_%04d.<ext>` convention of the
// extraction collaborator. Keys are compared as digit strings (shorter first once
// leading zeros are gone), so names with more digits than a `u64` holds still sort.

use crate::error::{PassError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::warn;

/// The numeric sort key of a frame name, or `None` when it carries no number or the
/// number does not fit a `u64`.
pub fn frame_sort_key(name: &str) -> Option<u64> {
    digit_key(name)?.parse().ok()
}

/// The embedded digits without leading zeros, or `None` when there are none.
fn digit_key(name: &str) -> Option<String> {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let significant = digits.trim_start_matches('0');
    Some(if significant.is_empty() { "0".to_string() } else { significant.to_string() })
}

fn compare_keys(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    frames: Vec<String>,
}

impl Manifest {
    /// Sorts names by embedded number. Names without a number are dropped; ties keep
    /// string order so every endpoint agrees.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keyed: Vec<(String, String)> = names
            .into_iter()
            .map(Into::into)
            .filter_map(|name| match digit_key(&name) {
                Some(key) => Some((key, name)),
                None => {
                    warn!(name = %name, "frame name carries no number, dropped");
                    None
                }
            })
            .collect();
        keyed.sort_by(|(a_key, a_name), (b_key, b_name)| compare_keys(a_key, b_key).then_with(|| a_name.cmp(b_name)));
        Self {
            frames: keyed.into_iter().map(|(_, name)| name).collect(),
        }
    }

    /// Lists the frames with extension `extension` in `dir`.
    /// Fails with `EmptyInput` when none match.
    pub fn scan(dir: &Path, extension: &str) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| PassError::filesystem("cannot list", dir, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PassError::filesystem("cannot list", dir, e))?;
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension));
            if matches && path.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let manifest = Self::from_names(names);
        if manifest.is_empty() {
            return Err(PassError::EmptyInput { dir: dir.to_path_buf() });
        }
        Ok(manifest)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.frames.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.frames
    }

    /// Where frame `index` lives under `dir`.
    pub fn path_in(&self, dir: &Path, index: usize) -> Option<PathBuf> {
        self.name(index).map(|name| dir.join(name))
    }
}
