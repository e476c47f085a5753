//! Drop-aware hex dumps.
//!
//! Sixteen bytes per row; bytes lost to capture gaps render as `--` in the
//! hex columns and `◆` in the glyph gutter, so holes in a reassembled stream
//! stay visible next to the data around them.

use std::fmt::Write;

/// Incremental dumper. Feed `Some(byte)` or `None` (missing), then `finish`.
pub struct HexDumper {
    out: String,
    offset: usize,
    row: Vec<Option<u8>>,
}

impl HexDumper {
    pub fn new() -> Self {
        HexDumper { out: String::new(), offset: 0, row: Vec::with_capacity(16) }
    }

    pub fn push(&mut self, b: Option<u8>) {
        self.row.push(b);
        if self.row.len() == 16 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.row.is_empty() {
            return;
        }

        let cell = |b: &Option<u8>| match b {
            Some(v) => format!("{v:02x}"),
            None => "--".to_string(),
        };
        let mut cells: Vec<String> = self.row.iter().map(cell).collect();
        cells.resize(16, "  ".to_string());

        let _ = write!(self.out, "{:08x}  ", self.offset);
        let _ = write!(self.out, "{}", cells[..8].join(" "));
        self.out.push_str("  ");
        let _ = write!(self.out, "{}", cells[8..].join(" "));
        self.out.push_str("  ║");
        for b in &self.row {
            self.out.push(glyph(*b));
        }
        self.out.push_str("║\n");

        self.offset += 16;
        self.row.clear();
    }

    pub fn finish(mut self) -> String {
        let trailing = self.row.len();
        self.flush();
        self.offset -= (16 - trailing) % 16;
        let _ = writeln!(self.out, "{:08x}", self.offset);
        self.out
    }
}

impl Default for HexDumper {
    fn default() -> Self {
        Self::new()
    }
}

fn glyph(b: Option<u8>) -> char {
    match b {
        None => '◆',
        Some(0) => '␀',
        Some(b'\r') => '␍',
        Some(b'\n') => '␤',
        // ';' and '_' are not in the printable set; they dot out like any
        // other unprintable byte.
        Some(b';') | Some(b'_') => '·',
        Some(c) if c.is_ascii_graphic() || c == b' ' => c as char,
        Some(_) => '·',
    }
}

/// Dump a plain byte slice.
pub fn hexdump(buf: &[u8]) -> String {
    let mut d = HexDumper::new();
    for &b in buf {
        d.push(Some(b));
    }
    d.finish()
}
