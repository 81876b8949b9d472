//! Location resolution: (plate, well identifier) to absolute deck coordinate.
//!
//! The execution core only depends on the [`LocationResolver`] trait.
//! [`PlateRegistry`] is the stock implementation over grid-shaped plates
//! loaded from configuration. It can be edited while tasks are queued;
//! moves resolve when they execute, not when they are created.

use crate::arm::Coordinate;
use crate::error::ResolutionError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a plate name and well identifier to a coordinate.
pub trait LocationResolver: Send + Sync {
    /// Resolves `well` on `plate`, or reports why it cannot.
    fn resolve(&self, plate: &str, well: &str) -> Result<Coordinate, ResolutionError>;
}

impl<R: LocationResolver + ?Sized> LocationResolver for Arc<R> {
    fn resolve(&self, plate: &str, well: &str) -> Result<Coordinate, ResolutionError> {
        (**self).resolve(plate, well)
    }
}

/// A rectangular plate with evenly spaced wells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateLayout {
    /// Plate name used by move tasks
    pub name: String,
    /// X of the A1 well center (cm)
    pub origin_x: f64,
    /// Y of the A1 well center (cm)
    pub origin_y: f64,
    /// Number of rows (A, B, ...)
    pub rows: u32,
    /// Number of columns (1, 2, ...)
    pub columns: u32,
    /// Distance between neighbouring columns (cm)
    #[serde(default = "default_pitch")]
    pub pitch_x: f64,
    /// Distance between neighbouring rows (cm)
    #[serde(default = "default_pitch")]
    pub pitch_y: f64,
}

// Standard SBS plate well spacing, 9 mm
fn default_pitch() -> f64 {
    0.9
}

impl PlateLayout {
    /// Coordinate of the well named by `identifier`.
    ///
    /// Accepts `"B3"` style identifiers (row letters, 1-based column) and
    /// plain 1-based indices counted row by row.
    pub fn locate(&self, identifier: &str) -> Result<Coordinate, ResolutionError> {
        let (row, column) = self.parse_identifier(identifier)?;
        if row == 0 || column == 0 || row > self.rows || column > self.columns {
            return Err(ResolutionError::OutOfRange {
                plate: self.name.clone(),
                well: identifier.to_string(),
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(Coordinate::new(
            self.origin_x + f64::from(column - 1) * self.pitch_x,
            self.origin_y + f64::from(row - 1) * self.pitch_y,
        ))
    }

    /// Splits an identifier into a 1-based (row, column) pair.
    fn parse_identifier(&self, identifier: &str) -> Result<(u32, u32), ResolutionError> {
        let invalid = || ResolutionError::InvalidWell {
            plate: self.name.clone(),
            well: identifier.to_string(),
        };
        let id = identifier.trim();
        if id.is_empty() {
            return Err(invalid());
        }

        if id.bytes().all(|b| b.is_ascii_digit()) {
            let index: u32 = id.parse().map_err(|_| invalid())?;
            if index == 0 || self.columns == 0 {
                return Err(invalid());
            }
            let zero_based = index - 1;
            return Ok((zero_based / self.columns + 1, zero_based % self.columns + 1));
        }

        let split = id
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (letters, digits) = id.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        // Spreadsheet-style: A..Z, AA, AB, ...
        let mut row: u32 = 0;
        for c in letters.chars() {
            let value = u32::from(c.to_ascii_uppercase()) - u32::from('A') + 1;
            row = row
                .checked_mul(26)
                .and_then(|r| r.checked_add(value))
                .ok_or_else(invalid)?;
        }
        let column: u32 = digits.parse().map_err(|_| invalid())?;
        Ok((row, column))
    }
}

/// Thread-safe set of plate layouts, replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct PlateRegistry {
    plates: Arc<RwLock<HashMap<String, PlateLayout>>>,
}

impl PlateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `plates`.
    pub fn from_layouts(plates: impl IntoIterator<Item = PlateLayout>) -> Self {
        let registry = Self::new();
        registry.replace_all(plates);
        registry
    }

    /// Adds or replaces a single plate. Returns the previous layout, if any.
    pub fn insert_plate(&self, layout: PlateLayout) -> Option<PlateLayout> {
        self.plates.write().insert(layout.name.clone(), layout)
    }

    /// Removes a plate by name.
    pub fn remove_plate(&self, name: &str) -> Option<PlateLayout> {
        self.plates.write().remove(name)
    }

    /// Swaps in a whole new set of plates in one step.
    pub fn replace_all(&self, plates: impl IntoIterator<Item = PlateLayout>) {
        let fresh: HashMap<_, _> = plates.into_iter().map(|p| (p.name.clone(), p)).collect();
        *self.plates.write() = fresh;
    }

    /// Names of all known plates, sorted.
    pub fn plate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plates.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl LocationResolver for PlateRegistry {
    fn resolve(&self, plate: &str, well: &str) -> Result<Coordinate, ResolutionError> {
        let plates = self.plates.read();
        let layout = plates
            .get(plate)
            .ok_or_else(|| ResolutionError::UnknownPlate(plate.to_string()))?;
        layout.locate(well)
    }
}
