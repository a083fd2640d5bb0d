//! Markdown export of a machine's sheets and stores.

use crate::machine::{Machine, StreamSheet};
use crate::message::MessageStore;
use std::fmt::Write as _;
use std::path::Path;
use streamsheets_engine::engine::{CellRef, format_dynamic};

/// Write every sheet of the machine to a markdown file.
pub fn write_markdown(path: &Path, machine: &Machine) -> std::io::Result<()> {
    std::fs::write(path, render_markdown(machine))
}

/// Render every sheet as a markdown table, followed by inbox and outbox summaries.
pub fn render_markdown(machine: &Machine) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", machine.name());
    for sheet in machine.sheets() {
        let _ = writeln!(out);
        render_sheet(&mut out, sheet);
        let inbox = sheet.inbox().lock();
        render_store(&mut out, "Inbox", inbox.store());
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## Outbox");
    render_store(&mut out, "Outbox", &machine.hub().outbox().lock());
    out
}

fn render_sheet(out: &mut String, sheet: &StreamSheet) {
    let _ = writeln!(out, "## {}", sheet.name());
    let _ = writeln!(out);

    let Some((min_row, min_col, max_row, max_col)) = find_grid_bounds(sheet) else {
        let _ = writeln!(out, "*Empty sheet*");
        return;
    };

    let _ = write!(out, "|   |");
    for col in min_col..=max_col {
        let _ = write!(out, " {} |", CellRef::col_to_letters(col));
    }
    let _ = writeln!(out);

    let _ = write!(out, "|---|");
    for _ in min_col..=max_col {
        let _ = write!(out, "---|");
    }
    let _ = writeln!(out);

    for row in min_row..=max_row {
        let _ = write!(out, "| {} |", row + 1); // 1-based row numbers
        for col in min_col..=max_col {
            let display = format_dynamic(&sheet.cell_value(&CellRef::new(col, row)));
            let _ = write!(out, " {} |", escape_markdown(&display));
        }
        let _ = writeln!(out);
    }
}

fn render_store(out: &mut String, label: &str, store: &MessageStore) {
    let _ = writeln!(out);
    if store.is_empty() {
        let _ = writeln!(out, "*{}: empty*", label);
        return;
    }
    let _ = writeln!(out, "{} ({} messages):", label, store.len());
    let _ = writeln!(out);
    for message in store.iter() {
        let _ = writeln!(
            out,
            "- `{}`: `{}`",
            message.id,
            escape_markdown(&message.data.to_string())
        );
    }
}

/// Bounds of the populated cells: (min_row, min_col, max_row, max_col).
fn find_grid_bounds(sheet: &StreamSheet) -> Option<(usize, usize, usize, usize)> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for entry in sheet.grid.iter() {
        let cell_ref = entry.key();
        bounds = Some(match bounds {
            None => (cell_ref.row, cell_ref.col, cell_ref.row, cell_ref.col),
            Some((r0, c0, r1, c1)) => (
                r0.min(cell_ref.row),
                c0.min(cell_ref.col),
                r1.max(cell_ref.row),
                c1.max(cell_ref.col),
            ),
        });
    }
    bounds
}

/// Escape special markdown characters in cell content
fn escape_markdown(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ").replace('\r', "")
}
