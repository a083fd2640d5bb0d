//! Cell and range reference parsing and formatting.
//!
//! Provides bidirectional conversion between spreadsheet-style references
//! (e.g., "A1", "B2", "AA100", "A1:C3") and zero-indexed column/row coordinates.
//!
//! # Examples
//!
//! ```ignore
//! let cell = CellRef::from_str("B3").unwrap();
//! assert_eq!(cell.col, 1);  // 0-indexed
//! assert_eq!(cell.row, 2);
//! assert_eq!(cell.to_string(), "B3");
//!
//! let range = RangeRef::parse("A1:C2").unwrap();
//! assert_eq!(range.width(), 3);
//! assert_eq!(range.height(), 2);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// A reference to a cell by column and row indices (0-indexed).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

fn a1_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?<letters>[A-Za-z]+)(?<numbers>[0-9]+)$")
            .expect("A1 reference regex must compile")
    })
}

impl CellRef {
    pub fn new(col: usize, row: usize) -> CellRef {
        CellRef { row, col }
    }

    /// Parse a cell reference from spreadsheet notation (e.g., "A1", "B2", "AA10").
    /// Returns None if the input is invalid.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(name: &str) -> Option<CellRef> {
        Self::parse_a1(name)
    }

    fn parse_a1(name: &str) -> Option<CellRef> {
        let caps = a1_re().captures(name.trim())?;
        let letters = &caps["letters"];
        let numbers = &caps["numbers"];

        let mut col_acc = 0usize;
        for c in letters.to_ascii_uppercase().bytes() {
            let digit = (c - b'A') as usize + 1;
            col_acc = col_acc.checked_mul(26)?.checked_add(digit)?;
        }
        let col = col_acc.checked_sub(1)?;

        let row = numbers.parse::<usize>().ok()?.checked_sub(1)?;

        Some(CellRef::new(col, row))
    }

    /// Convert column index to spreadsheet-style letters (0 -> A, 25 -> Z, 26 -> AA).
    pub fn col_to_letters(col: usize) -> String {
        let mut result = String::new();
        let mut n = col as u128 + 1;
        while n > 0 {
            n -= 1;
            result.insert(0, (b'A' + (n % 26) as u8) as char);
            n /= 26;
        }
        result
    }

    /// Position of this cell relative to `origin` (which must be above-left of it).
    pub fn offset_from(&self, origin: &CellRef) -> Option<(usize, usize)> {
        Some((
            self.col.checked_sub(origin.col)?,
            self.row.checked_sub(origin.row)?,
        ))
    }
}

impl std::str::FromStr for CellRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_a1(s).ok_or_else(|| format!("Invalid cell reference: {}", s))
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CellRef::col_to_letters(self.col), self.row + 1)
    }
}

/// A rectangular block of cells. `start` is always the top-left corner.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RangeRef {
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    /// Build a normalized range from two arbitrary corners.
    pub fn new(a: CellRef, b: CellRef) -> RangeRef {
        RangeRef {
            start: CellRef::new(a.col.min(b.col), a.row.min(b.row)),
            end: CellRef::new(a.col.max(b.col), a.row.max(b.row)),
        }
    }

    pub fn single(cell: CellRef) -> RangeRef {
        RangeRef {
            start: cell.clone(),
            end: cell,
        }
    }

    /// Parse "A1:B5" (or a lone "A1", which yields a single-cell range).
    pub fn parse(range: &str) -> Option<RangeRef> {
        match range.split_once(':') {
            Some((a, b)) => Some(RangeRef::new(CellRef::from_str(a)?, CellRef::from_str(b)?)),
            None => CellRef::from_str(range).map(RangeRef::single),
        }
    }

    pub fn width(&self) -> usize {
        self.end.col - self.start.col + 1
    }

    pub fn height(&self) -> usize {
        self.end.row - self.start.row + 1
    }

    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, cell: &CellRef) -> bool {
        (self.start.col..=self.end.col).contains(&cell.col)
            && (self.start.row..=self.end.row).contains(&cell.row)
    }

    /// Cell at a (col, row) offset inside the range, if within bounds.
    pub fn cell_at(&self, col_offset: usize, row_offset: usize) -> Option<CellRef> {
        if col_offset < self.width() && row_offset < self.height() {
            Some(CellRef::new(
                self.start.col + col_offset,
                self.start.row + row_offset,
            ))
        } else {
            None
        }
    }

    /// Same origin, new size.
    pub fn resized(&self, width: usize, height: usize) -> RangeRef {
        RangeRef {
            start: self.start.clone(),
            end: CellRef::new(
                self.start.col + width.max(1) - 1,
                self.start.row + height.max(1) - 1,
            ),
        }
    }

    /// Iterate cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (self.start.row..=self.end.row)
            .flat_map(move |row| (self.start.col..=self.end.col).map(move |col| CellRef::new(col, row)))
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}
