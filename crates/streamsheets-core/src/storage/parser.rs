//! Parser for the `REF: value` cell listing used in machine definitions.

use crate::error::{Result, StreamsheetsError};
use streamsheets_engine::engine::{Cell, CellRef};

/// Parse cell lines into cells, in listing order.
pub fn parse_cells(content: &str) -> Result<Vec<(CellRef, Cell)>> {
    let mut cells = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((cell_ref_str, value_str)) = line.split_once(':') else {
            return Err(StreamsheetsError::Parse {
                line: line_num + 1,
                message: "Expected 'CELLREF: VALUE' format".to_string(),
            });
        };

        let cell_ref_str = cell_ref_str.trim();
        let cell_ref = CellRef::from_str(cell_ref_str).ok_or_else(|| StreamsheetsError::Parse {
            line: line_num + 1,
            message: format!("Invalid cell reference: {}", cell_ref_str),
        })?;

        let cell = parse_cell_value(value_str, line_num + 1)?;
        cells.push((cell_ref, cell));
    }

    Ok(cells)
}

fn parse_cell_value(value: &str, line_num: usize) -> Result<Cell> {
    let value = value.trim();

    if value.is_empty() {
        return Ok(Cell::new_empty());
    }

    if let Some(formula) = value.strip_prefix('=') {
        return Ok(Cell::new_script(formula.trim()));
    }

    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        let text = unescape_text(&value[1..value.len() - 1]);
        return Ok(Cell::new_text(&text));
    }

    match value {
        "TRUE" => return Ok(Cell::new_bool(true)),
        "FALSE" => return Ok(Cell::new_bool(false)),
        _ => {}
    }

    if let Ok(n) = value.parse::<f64>() {
        return Ok(Cell::new_number(n));
    }

    Err(StreamsheetsError::Parse {
        line: line_num,
        message: format!("Invalid value: {}. Use quotes for text.", value),
    })
}

fn unescape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsheets_engine::engine::CellType;

    #[test]
    fn test_parse_kinds() {
        let content = r#"
# sensor sheet
A1: 42
A2: "He said \"hi\""
A3: TRUE
B1: =READ(INBOXDATA("", "", "temperature"))
"#;
        let cells = parse_cells(content).unwrap();
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[0].0, CellRef::new(0, 0));
        assert_eq!(cells[0].1.contents, CellType::Number(42.0));
        assert_eq!(cells[1].1.contents, CellType::Text("He said \"hi\"".to_string()));
        assert_eq!(cells[2].1.contents, CellType::Bool(true));
        assert_eq!(
            cells[3].1.contents,
            CellType::Script(r#"READ(INBOXDATA("", "", "temperature"))"#.to_string())
        );
    }

    #[test]
    fn test_formula_may_contain_colons() {
        let cells = parse_cells("C1: =JSON(A1:B3)").unwrap();
        assert_eq!(cells[0].1.contents, CellType::Script("JSON(A1:B3)".to_string()));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        match parse_cells("A1: 1\nnot a cell") {
            Err(StreamsheetsError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other.map(|c| c.len())),
        }
        match parse_cells("ZZ: 1") {
            Err(StreamsheetsError::Parse { message, .. }) => {
                assert!(message.contains("Invalid cell reference"))
            }
            other => panic!("expected parse error, got {:?}", other.map(|c| c.len())),
        }
        assert!(parse_cells("A1: bare words").is_err());
    }
}
