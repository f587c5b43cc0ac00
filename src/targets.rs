//! Target sheet loading.
//!
//! A sheet is delimited text exported from the lab spreadsheet: a header row, then one
//! row per dispensing target with the columns material, target weight (g), density,
//! particle size and empty vial weight. Comma, semicolon and tab separators are
//! recognised from the header.
//!
//! Cells are forgiving. A missing or invalid target weight becomes
//! [`DEFAULT_TARGET_WEIGHT`], a missing material becomes [`UNKNOWN_MATERIAL`], and
//! missing material parameters carry over from the previous row (the first row
//! inherits the configured parameters).

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborators::RowSource;
use crate::config::MaterialParameters;
use crate::{DoserError, Result};

/// Target weight used when a row has none.
pub const DEFAULT_TARGET_WEIGHT: f64 = 10.0;

/// Material name used when a row has none.
pub const UNKNOWN_MATERIAL: &str = "Unknown";

const SEPARATORS: [char; 3] = ['\t', ';', ','];

/// One dispensing target, resolved and immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub material: String,
    pub target_weight: f64,
    pub density: f64,
    pub particle_size: f64,
    pub vial_weight: f64,
}

impl Target {
    /// Material parameters in effect while this target runs.
    pub fn apply_to(&self, parameters: &MaterialParameters) -> MaterialParameters {
        MaterialParameters {
            density: self.density,
            particle_size: self.particle_size,
            vial_weight: self.vial_weight,
            ..*parameters
        }
    }
}

/// Rows of a target sheet, consumed front to back.
#[derive(Debug, Clone, Default)]
pub struct TargetTable {
    name: String,
    rows: VecDeque<Target>,
    total: usize,
}

impl TargetTable {
    /// Read the sheet at `path`. The table is named after the file stem.
    pub fn load(path: impl AsRef<Path>, defaults: &MaterialParameters) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DoserError::file_error(path, e))?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();

        let table = Self::parse(name, &text, defaults);
        info!(path = %path.display(), rows = table.len(), "Target sheet loaded");
        Ok(table)
    }

    /// Parse sheet text.
    pub fn parse(name: impl Into<String>, text: &str, defaults: &MaterialParameters) -> Self {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let separator = lines.next().map(detect_separator).unwrap_or(',');

        let mut current = *defaults;
        let mut rows = VecDeque::new();
        for (index, line) in lines.enumerate() {
            let row = index + 1;
            let cells: Vec<&str> = line.split(separator).map(str::trim).collect();
            let target = resolve_row(row, &cells, &mut current);
            debug!(
                row,
                material = %target.material,
                target_weight = target.target_weight,
                "Target row"
            );
            rows.push_back(target);
        }

        let total = rows.len();
        Self { name: name.into(), rows, total }
    }

    /// Sheet name, used in result file names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rows not yet consumed.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in the sheet, consumed or not.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.rows.iter()
    }
}

impl RowSource for TargetTable {
    fn next_row(&mut self) -> Option<Target> {
        self.rows.pop_front()
    }

    fn remaining(&self) -> usize {
        self.rows.len()
    }

    fn sheet_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

fn detect_separator(header: &str) -> char {
    SEPARATORS
        .into_iter()
        .max_by_key(|separator| header.matches(*separator).count())
        .filter(|separator| header.contains(*separator))
        .unwrap_or(',')
}

fn resolve_row(row: usize, cells: &[&str], current: &mut MaterialParameters) -> Target {
    let cell = |column: usize| cells.get(column).copied().filter(|c| !c.is_empty());
    let number = |column: usize| {
        cell(column).and_then(|c| c.parse::<f64>().ok()).filter(|v| v.is_finite())
    };

    let material = cell(0).unwrap_or(UNKNOWN_MATERIAL).to_string();

    let target_weight = match number(1).filter(|w| *w > 0.0) {
        Some(weight) => weight,
        None => {
            warn!(row, cell = ?cell(1), "Invalid target weight, using {} g", DEFAULT_TARGET_WEIGHT);
            DEFAULT_TARGET_WEIGHT
        }
    };

    match number(2) {
        Some(density) if density > 0.0 => current.density = density,
        Some(density) => warn!(row, density, "Non-positive density ignored"),
        None => {}
    }
    if let Some(particle_size) = number(3) {
        current.particle_size = particle_size;
    }
    if let Some(vial_weight) = number(4) {
        current.vial_weight = vial_weight;
    }

    Target {
        material,
        target_weight,
        density: current.density,
        particle_size: current.particle_size,
        vial_weight: current.vial_weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> MaterialParameters {
        MaterialParameters::default()
    }

    #[test]
    fn header_is_skipped_and_rows_resolve() {
        let sheet =
            "material,target,density,particle,vial\nsalt,12.5,2.16,1.0,9.8\nsugar,8,1.59,,\n";
        let mut table = TargetTable::parse("batch", sheet, &defaults());

        assert_eq!(table.total(), 2);
        let salt = table.next_row().unwrap();
        assert_eq!(salt, Target {
            material: "salt".into(),
            target_weight: 12.5,
            density: 2.16,
            particle_size: 1.0,
            vial_weight: 9.8,
        });

        let sugar = table.next_row().unwrap();
        assert_eq!(sugar.density, 1.59);
        assert_eq!(sugar.particle_size, 1.0, "particle size carries over");
        assert_eq!(sugar.vial_weight, 9.8, "vial weight carries over");

        assert_eq!(table.next_row(), None);
        assert_eq!(table.remaining(), 0);
    }

    #[test]
    fn missing_cells_fall_back() {
        let sheet = "material;target\n;abc\nflour;-2\n";
        let table = TargetTable::parse("s", sheet, &defaults());
        let rows: Vec<_> = table.iter().cloned().collect();

        assert_eq!(rows[0].material, UNKNOWN_MATERIAL);
        assert_eq!(rows[0].target_weight, DEFAULT_TARGET_WEIGHT);
        assert_eq!(rows[0].density, 2.11);
        assert_eq!(rows[1].material, "flour");
        assert_eq!(rows[1].target_weight, DEFAULT_TARGET_WEIGHT);
    }

    #[test]
    fn tab_separated_with_blank_lines() {
        let sheet = "material\ttarget\tdensity\n\nsand\t20\t0\n\n";
        let table = TargetTable::parse("s", sheet, &defaults());
        assert_eq!(table.len(), 1);
        let sand = table.iter().next().unwrap();
        assert_eq!(sand.target_weight, 20.0);
        assert_eq!(sand.density, 2.11, "zero density is ignored");
    }

    #[test]
    fn header_only_sheet_is_empty() {
        assert!(TargetTable::parse("s", "material,target\n", &defaults()).is_empty());
        assert!(TargetTable::parse("s", "", &defaults()).is_empty());
    }

    #[test]
    fn load_names_table_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_07.csv");
        std::fs::write(&path, "m,t\nsalt,5\n").unwrap();

        let table = TargetTable::load(&path, &defaults()).unwrap();
        assert_eq!(table.name(), "run_07");
        assert_eq!(table.len(), 1);

        let missing = TargetTable::load(dir.path().join("absent.csv"), &defaults());
        assert!(matches!(missing, Err(DoserError::File { .. })));
    }

    #[test]
    fn target_overrides_material_parameters() {
        let target = Target {
            material: "salt".into(),
            target_weight: 5.0,
            density: 3.0,
            particle_size: 0.5,
            vial_weight: 8.0,
        };
        let applied = target.apply_to(&MaterialParameters { simulate_weight: false, ..defaults() });
        assert_eq!(applied.density, 3.0);
        assert_eq!(applied.vial_weight, 8.0);
        assert!(!applied.simulate_weight);
    }
}
