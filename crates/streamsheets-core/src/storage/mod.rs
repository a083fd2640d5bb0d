//! Cell listing parser and markdown export

mod md;
mod parser;

pub use md::{render_markdown, write_markdown};
pub use parser::parse_cells;
