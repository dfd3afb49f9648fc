use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub index: usize,
    pub text: String,
    pub is_edited: bool,
}

impl Line {
    /// The text with `;` and `( ... )` comments removed.
    pub fn command(&self) -> String {
        strip_comments(&self.text)
    }

    pub fn is_executable(&self) -> bool {
        !self.command().is_empty()
    }
}

/// Remove `;` and `( ... )` comments and a bare `%` delimiter.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    let trimmed = out.trim();
    // Program delimiters
    if trimmed == "%" {
        return String::new();
    }
    trimmed.to_string()
}

/// One address word such as `X-1.5` or `G91`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f64,
}

/// Split a comment-free command into words. Tolerates missing spaces
/// (`G0X1Y2`) and ignores anything it cannot read.
pub fn words(command: &str) -> Vec<Word> {
    let chars: Vec<char> = command.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !c.is_ascii_alphabetic() {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && chars[end] == ' ' {
            end += 1;
        }
        let num_start = end;
        while end < chars.len() && (chars[end].is_ascii_digit() || matches!(chars[end], '.' | '-' | '+')) {
            end += 1;
        }
        let number: String = chars[num_start..end].iter().collect();
        if let Ok(value) = number.parse::<f64>() {
            out.push(Word {
                letter: c.to_ascii_uppercase(),
                value,
            });
        }
        i = end.max(start);
    }
    out
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStats {
    pub total: usize,
    pub executable: usize,
    pub edited: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    lines: Vec<Line>,
    path: Option<PathBuf>,
}

impl Program {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(index, raw)| Line {
                index,
                text: raw.trim_end_matches('\r').to_string(),
                is_edited: false,
            })
            .collect();
        Self { lines, path: None }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut program = Self::parse(&text);
        program.path = Some(path.to_path_buf());
        Ok(program)
    }

    /// Write the current texts, edits included.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut text = self
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        text.push('\n');
        std::fs::write(path, text)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Line> {
        self.lines.get(index)
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Replace a line's text. Returns `false` if the index is out of range.
    pub fn edit(&mut self, index: usize, text: &str) -> bool {
        match self.lines.get_mut(index) {
            Some(line) => {
                line.text = text.to_string();
                line.is_edited = true;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ProgramStats {
        ProgramStats {
            total: self.lines.len(),
            executable: self.lines.iter().filter(|l| l.is_executable()).count(),
            edited: self.lines.iter().filter(|l| l.is_edited).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Line {
        Line {
            index: 0,
            text: text.into(),
            is_edited: false,
        }
    }

    #[test]
    fn test_command_strips_comments() {
        assert_eq!(line("G0 X1 ; rapid").command(), "G0 X1");
        assert_eq!(line("G1 (MSG, cutting) Z-1 F200").command(), "G1  Z-1 F200");
        assert!(!line("(header)").is_executable());
        assert!(!line("   ").is_executable());
        assert!(!line("%").is_executable());
        assert!(line("M3 S1000").is_executable());
    }

    #[test]
    fn test_words() {
        let w = words("G0X1.5 y-2 Z +3");
        assert_eq!(
            w,
            vec![
                Word { letter: 'G', value: 0.0 },
                Word { letter: 'X', value: 1.5 },
                Word { letter: 'Y', value: -2.0 },
                Word { letter: 'Z', value: 3.0 },
            ]
        );
    }

    #[test]
    fn test_parse_edit_and_stats() {
        let mut program = Program::parse("G21\r\n(comment)\n\nG0 X1\n");
        assert_eq!(program.len(), 4);
        assert_eq!(program.get(0).unwrap().text, "G21");

        assert!(program.edit(3, "G0 X2"));
        assert!(!program.edit(9, "G0"));
        assert_eq!(
            program.stats(),
            ProgramStats { total: 4, executable: 2, edited: 1 }
        );
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.nc");
        let mut program = Program::parse("G21\nG0 X1");
        program.edit(1, "G0 X5");
        program.save(&path).unwrap();

        let loaded = Program::load(&path).unwrap();
        assert_eq!(loaded.get(1).unwrap().text, "G0 X5");
        assert_eq!(loaded.path(), Some(path.as_path()));
    }
}
