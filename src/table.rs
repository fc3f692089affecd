use std::io::{self, Write};

use colored::ColoredString;

enum Line {
    Row(Vec<String>),
    Separator,
}

/// Table with box-drawing characters, written to any sink.
///
/// Cells may carry ANSI styling; widths are computed on the visible text.
pub struct SimpleTable {
    headers: Vec<String>,
    lines: Vec<Line>,
    header_style: Option<fn(&str) -> ColoredString>,
    footer: Vec<Vec<String>>,
}

impl SimpleTable {
    pub fn new(headers: Vec<&str>) -> Self {
        Self {
            headers: headers.into_iter().map(String::from).collect(),
            lines: Vec::new(),
            header_style: None,
            footer: Vec::new(),
        }
    }

    pub fn header_style(mut self, f: fn(&str) -> ColoredString) -> Self {
        self.header_style = Some(f);
        self
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.lines.push(Line::Row(row));
    }

    pub fn add_separator(&mut self) {
        self.lines.push(Line::Separator);
    }

    /// Footer rows are drawn below a separator, e.g. one TOTAL row per currency.
    pub fn add_footer(&mut self, footer: Vec<String>) {
        self.footer.push(footer);
    }

    fn widths(&self) -> Vec<usize> {
        let num_cols = self.headers.len();
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        let rows = self
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Row(cells) => Some(cells),
                Line::Separator => None,
            })
            .chain(self.footer.iter());
        for row in rows {
            for (i, cell) in row.iter().enumerate().take(num_cols) {
                widths[i] = widths[i].max(visible_width(cell));
            }
        }
        widths
    }

    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        let widths = self.widths();

        border(w, &widths, '┌', '┬', '┐')?;

        write!(w, "│")?;
        for (i, header) in self.headers.iter().enumerate() {
            let padded = format!("{:width$}", header, width = widths[i]);
            match self.header_style {
                Some(style) => write!(w, " {} │", style(&padded))?,
                None => write!(w, " {} │", padded)?,
            }
        }
        writeln!(w)?;

        border(w, &widths, '├', '┼', '┤')?;

        for line in &self.lines {
            match line {
                Line::Row(cells) => row(w, &widths, cells)?,
                Line::Separator => border(w, &widths, '├', '┼', '┤')?,
            }
        }

        if !self.footer.is_empty() {
            border(w, &widths, '├', '┼', '┤')?;
            for cells in &self.footer {
                row(w, &widths, cells)?;
            }
        }

        border(w, &widths, '└', '┴', '┘')
    }
}

fn border(w: &mut dyn Write, widths: &[usize], left: char, mid: char, right: char) -> io::Result<()> {
    write!(w, "{left}")?;
    for (i, width) in widths.iter().enumerate() {
        write!(w, "{}", "─".repeat(width + 2))?;
        if i < widths.len() - 1 {
            write!(w, "{mid}")?;
        }
    }
    writeln!(w, "{right}")
}

fn row(w: &mut dyn Write, widths: &[usize], cells: &[String]) -> io::Result<()> {
    write!(w, "│")?;
    for (i, width) in widths.iter().enumerate() {
        let cell = cells.get(i).map(String::as_str).unwrap_or("");
        let pad = width.saturating_sub(visible_width(cell));
        write!(w, " {}{} │", cell, " ".repeat(pad))?;
    }
    writeln!(w)
}

fn visible_width(s: &str) -> usize {
    strip_ansi(s).chars().count()
}

pub fn strip_ansi(s: &str) -> String {
    let mut result = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c == 'm' {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Truncate to `max_len` characters, ending in "..." when shortened.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    } else {
        s.chars().take(max_len).collect()
    }
}
