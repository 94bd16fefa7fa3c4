//! Program storage and editor operations
//!
//! A program is an ordered sequence of text lines, addressed 1-based from
//! the editor's point of view.  Lines are reference counted so the engine
//! can keep hold of the line it is executing while editor commands rewrite
//! the store.

use std::fs;
use std::io::{self, Write};
use std::rc::Rc;

use crate::lexer::{is_alpha, is_digit};

pub struct Program {
    lines: Vec<Rc<String>>,
}

impl Program {
    pub fn new() -> Self {
        Program { lines: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Delete the whole program.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// The line at 0-based index `idx`.
    pub fn line(&self, idx: usize) -> Rc<String> {
        Rc::clone(&self.lines[idx])
    }

    /// Insert a line at 0-based position `idx` (the new line becomes line
    /// `idx + 1` in editor numbering).
    pub fn insert_at(&mut self, idx: usize, text: &str) {
        let idx = idx.min(self.lines.len());
        self.lines.insert(idx, Rc::new(text.to_string()));
    }

    pub fn push(&mut self, text: &str) {
        self.lines.push(Rc::new(text.to_string()));
    }

    pub fn insert_first(&mut self, text: &str) {
        self.insert_at(0, text);
    }

    /// Replace line `n` (1-based).  Returns false if no such line.
    pub fn change(&mut self, n: usize, text: &str) -> bool {
        if n == 0 || n > self.lines.len() {
            return false;
        }
        self.lines[n - 1] = Rc::new(text.to_string());
        true
    }

    /// Delete lines `start..=end` (1-based).  Out-of-range or reversed
    /// ranges are quietly clipped; deleting line 0 is a no-op.
    pub fn delete(&mut self, start: usize, end: usize) {
        if start == 0 || end < start || start > self.lines.len() {
            return;
        }
        let end = end.min(self.lines.len());
        self.lines.drain(start - 1..end);
    }

    /// Locate the declaration `sub NAME(...)`.  Returns the 0-based line
    /// index and the byte offset of the `(` after the name.
    pub fn find_sub(&self, name: &str) -> Option<(usize, usize)> {
        for (idx, line) in self.lines.iter().enumerate() {
            let bytes = line.as_bytes();
            let mut p = 0;
            while bytes.get(p) == Some(&b' ') {
                p += 1;
            }
            if !bytes[p..].starts_with(b"sub ") {
                continue;
            }
            p += 4;
            while bytes.get(p) == Some(&b' ') {
                p += 1;
            }
            let start = p;
            while bytes.get(p).is_some_and(|&c| is_alpha(c) || is_digit(c)) {
                p += 1;
            }
            if &line[start..p] != name {
                continue;
            }
            while let Some(&c) = bytes.get(p) {
                if c == b'(' {
                    return Some((idx, p));
                }
                p += 1;
            }
        }
        None
    }

    /// Load a program from a source file, replacing the current one.
    /// Returns the number of lines read.
    pub fn load(&mut self, path: &str) -> io::Result<usize> {
        let text = fs::read_to_string(path)?;
        self.lines = text
            .lines()
            .map(|l| Rc::new(l.trim_end_matches('\r').to_string()))
            .collect();
        Ok(self.lines.len())
    }

    /// Write the program to a source file.
    pub fn save(&self, path: &str) -> io::Result<()> {
        let mut f = fs::File::create(path)?;
        for line in &self.lines {
            f.write_all(line.as_bytes())?;
            f.write_all(b"\n")?;
        }
        Ok(())
    }

    /// List lines `start..=end` (1-based) to `out`.
    pub fn list(&self, start: usize, end: usize, out: &mut dyn Write) -> io::Result<()> {
        for (i, line) in self.lines.iter().enumerate() {
            let n = i + 1;
            if n >= start && n <= end {
                writeln!(out, "{} {}", n, line)?;
            }
        }
        Ok(())
    }
}
