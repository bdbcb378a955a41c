//! Label filter overlay: per-point label lists, the string-to-id map,
//! filter seed medoids, the universal label, and dummy-point bookkeeping.
//!
//! Per-point labels are stored flat: `offsets[i]` and `counts[i]` delimit
//! point `i`'s run inside `labels`. Dummy points are builder-inserted
//! duplicates that boost filtered recall; they are suppressed in unfiltered
//! search and mapped back to their real ids on output.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use rand::Rng;
use tracing::info;

use crate::error::{Result, SearchError};

/// All filter-related tables for one index.
#[derive(Default)]
pub struct LabelSet {
    offsets: Vec<u32>,
    counts: Vec<u32>,
    labels: Vec<u32>,
    label_map: HashMap<String, u32>,
    filter_to_medoids: HashMap<u32, Vec<u32>>,
    universal: Option<u32>,
    dummy_points: HashSet<u32>,
    dummy_to_real: HashMap<u32, u32>,
}

impl LabelSet {
    /// Parse `<index>_labels.txt`: one line per point, comma-separated
    /// numeric labels. Every point must carry at least one label.
    pub fn parse_label_file(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        self.offsets.clear();
        self.counts.clear();
        self.labels.clear();
        for (line_no, line) in content.lines().enumerate() {
            self.offsets.push(self.labels.len() as u32);
            let mut count = 0u32;
            for token in line.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let label: u32 = token.parse().map_err(|_| {
                    SearchError::CorruptIndex(format!(
                        "{}: bad label '{}' on line {}",
                        path.display(),
                        token,
                        line_no + 1
                    ))
                })?;
                self.labels.push(label);
                count += 1;
            }
            if count == 0 {
                return Err(SearchError::CorruptIndex(format!(
                    "{}: point {} has no labels",
                    path.display(),
                    line_no
                )));
            }
            self.counts.push(count);
        }
        info!(
            points = self.counts.len(),
            labels = self.labels.len(),
            "parsed label file"
        );
        Ok(self.counts.len())
    }

    /// Parse `<index>_labels_map.txt`: tab-separated `string \t id` lines.
    pub fn load_label_map(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        for line in content.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(name), Some(id)) = (parts.next(), parts.next()) else {
                continue;
            };
            let id: u32 = id.trim().parse().map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: bad label id in line '{}'",
                    path.display(),
                    line
                ))
            })?;
            self.label_map.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Parse `<index>_labels_to_medoids.txt`: csv `label, m1, m2, ...`.
    pub fn load_filter_medoids(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        for line in content.lines() {
            let mut fields = line.split(',').map(str::trim).filter(|s| !s.is_empty());
            let Some(label) = fields.next() else {
                continue;
            };
            let label: u32 = label.parse().map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: bad filter label in line '{}'",
                    path.display(),
                    line
                ))
            })?;
            let medoids: std::result::Result<Vec<u32>, _> =
                fields.map(str::parse::<u32>).collect();
            let medoids = medoids.map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: bad medoid id in line '{}'",
                    path.display(),
                    line
                ))
            })?;
            self.filter_to_medoids.insert(label, medoids);
        }
        Ok(())
    }

    /// Parse `<index>_universal_label.txt`: a single integer.
    pub fn load_universal_label(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let label: u32 = content.trim().parse().map_err(|_| {
            SearchError::CorruptIndex(format!("{}: bad universal label", path.display()))
        })?;
        self.universal = Some(label);
        Ok(())
    }

    /// Parse `<index>_dummy_map.txt`: csv `dummy_id, real_id` lines.
    pub fn load_dummy_map(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        for line in content.lines() {
            let mut fields = line.split(',').map(str::trim);
            let (Some(dummy), Some(real)) = (fields.next(), fields.next()) else {
                continue;
            };
            let dummy: u32 = dummy.parse().map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: bad dummy id in line '{}'",
                    path.display(),
                    line
                ))
            })?;
            let real: u32 = real.parse().map_err(|_| {
                SearchError::CorruptIndex(format!(
                    "{}: bad real id in line '{}'",
                    path.display(),
                    line
                ))
            })?;
            self.dummy_points.insert(dummy);
            self.dummy_to_real.insert(dummy, real);
        }
        info!(dummies = self.dummy_points.len(), "loaded dummy map");
        Ok(())
    }

    /// Resolve a user-facing label string to its id. Falls back to the
    /// universal label when the string is unknown and one is defined.
    pub fn resolve(&self, name: &str) -> Result<u32> {
        if let Some(&id) = self.label_map.get(name) {
            return Ok(id);
        }
        if let Some(u) = self.universal {
            return Ok(u);
        }
        Err(SearchError::UnknownLabel(name.to_string()))
    }

    /// Whether `point_id` carries `label_id`.
    pub fn point_has_label(&self, point_id: u32, label_id: u32) -> bool {
        let Some(&start) = self.offsets.get(point_id as usize) else {
            return false;
        };
        let count = self.counts[point_id as usize] as usize;
        self.labels[start as usize..start as usize + count].contains(&label_id)
    }

    /// Whether a neighbor passes the filter: it carries the requested label,
    /// or the universal label when one is set.
    pub fn accepts(&self, point_id: u32, label_id: u32) -> bool {
        self.point_has_label(point_id, label_id)
            || self
                .universal
                .is_some_and(|u| self.point_has_label(point_id, u))
    }

    pub fn universal_label(&self) -> Option<u32> {
        self.universal
    }

    /// Seed medoids registered for `label`, if any.
    pub fn medoids_for(&self, label: u32) -> Option<&[u32]> {
        self.filter_to_medoids.get(&label).map(Vec::as_slice)
    }

    pub fn has_filter_medoids(&self) -> bool {
        !self.filter_to_medoids.is_empty()
    }

    /// Medoid lists of every registered filter label.
    pub fn all_filter_medoids(&self) -> impl Iterator<Item = &[u32]> {
        self.filter_to_medoids.values().map(Vec::as_slice)
    }

    pub fn is_dummy(&self, id: u32) -> bool {
        self.dummy_points.contains(&id)
    }

    /// Map a dummy id back to its real point; identity for real ids.
    pub fn to_real(&self, id: u32) -> u32 {
        self.dummy_to_real.get(&id).copied().unwrap_or(id)
    }

    /// Number of points the label file covered.
    pub fn num_points(&self) -> usize {
        self.counts.len()
    }

    /// Draw labels from the base distribution, used by the sample-driven
    /// cache warmup on filtered indices.
    pub fn random_labels(&self, count: usize) -> Result<Vec<u32>> {
        if self.labels.is_empty() {
            return Err(SearchError::BadArgument(
                "no labels loaded, cannot sample".into(),
            ));
        }
        let mut rng = rand::rng();
        Ok((0..count)
            .map(|_| self.labels[rng.random_range(0..self.labels.len())])
            .collect())
    }
}
