//! Formula preprocessing.
//!
//! Before formulas can be evaluated by Rhai, cell references must be
//! transformed into function calls:
//!
//! - `A1` → `VALUE(0, 0)` (the current value of the cell)
//! - `@A1` → `REF(0, 0, 0, 0)` (a reference to the cell itself)
//! - `A1:C3` → `REF(0, 0, 2, 2)` (a range reference; col/row order)
//!
//! References inside string literals are left untouched.

use regex::Regex;
use std::sync::OnceLock;

use super::cell_ref::CellRef;

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z]+[0-9]+):([A-Za-z]+[0-9]+)\b").expect("range regex must compile")
    })
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z]+)([0-9]+)\b").expect("reference regex must compile"))
}

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z]+)([0-9]+)\b").expect("cell regex must compile"))
}

/// Replace cell references with Rhai function calls.
pub fn preprocess_script(script: &str) -> String {
    preprocess_script_with_context(script, None)
}

/// Preprocess script with optional current cell context for ROW()/COL().
/// When context is provided, ROW() and COL() are replaced with 1-based row/col values.
pub fn preprocess_script_with_context(script: &str, context: Option<&CellRef>) -> String {
    let script = if let Some(cell_ref) = context {
        static ROW_RE: OnceLock<Regex> = OnceLock::new();
        static COL_RE: OnceLock<Regex> = OnceLock::new();
        let row_re = ROW_RE.get_or_init(|| Regex::new(r"\bROW\(\s*\)").expect("ROW regex"));
        let col_re = COL_RE.get_or_init(|| Regex::new(r"\bCOL\(\s*\)").expect("COL regex"));
        let script = row_re
            .replace_all(script, (cell_ref.row + 1).to_string())
            .to_string();
        col_re
            .replace_all(&script, (cell_ref.col + 1).to_string())
            .to_string()
    } else {
        script.to_string()
    };

    replace_refs_outside_strings(&script)
}

fn replace_segment(seg: &str) -> String {
    let seg = range_re()
        .replace_all(seg, |caps: &regex::Captures| {
            match (CellRef::from_str(&caps[1]), CellRef::from_str(&caps[2])) {
                (Some(start), Some(end)) => format!(
                    "REF({}, {}, {}, {})",
                    start.col, start.row, end.col, end.row
                ),
                _ => caps[0].to_string(),
            }
        })
        .to_string();

    let seg = reference_re()
        .replace_all(&seg, |caps: &regex::Captures| {
            let cell_ref = format!("{}{}", &caps[1], &caps[2]);
            match CellRef::from_str(&cell_ref) {
                Some(cr) => format!("REF({}, {}, {}, {})", cr.col, cr.row, cr.col, cr.row),
                None => caps[0].to_string(),
            }
        })
        .to_string();

    cell_re()
        .replace_all(&seg, |caps: &regex::Captures| {
            let cell_ref = format!("{}{}", &caps[1], &caps[2]);
            match CellRef::from_str(&cell_ref) {
                Some(cr) => format!("VALUE({}, {})", cr.col, cr.row),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

fn replace_refs_outside_strings(script: &str) -> String {
    let bytes = script.as_bytes();
    let mut out = String::new();
    let mut seg_start = 0;
    let mut in_string = false;
    let mut backslashes = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'\\' {
                backslashes += 1;
                i += 1;
                continue;
            }
            if b == b'"' && backslashes.is_multiple_of(2) {
                out.push_str(&script[seg_start..=i]);
                in_string = false;
                seg_start = i + 1;
            }
            backslashes = 0;
            i += 1;
            continue;
        }

        if b == b'"' {
            out.push_str(&replace_segment(&script[seg_start..i]));
            in_string = true;
            seg_start = i;
            backslashes = 0;
            i += 1;
            continue;
        }

        i += 1;
    }

    if seg_start < script.len() {
        if in_string {
            out.push_str(&script[seg_start..]);
        } else {
            out.push_str(&replace_segment(&script[seg_start..]));
        }
    }

    out
}
