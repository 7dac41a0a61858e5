//! Chunk types and per-chunk complexity scoring.

use serde::{Deserialize, Serialize};

/// Complexity weight for linear moves (G1).
const WEIGHT_LINEAR: f64 = 1.0;
/// Complexity weight for rapid moves (G0).
const WEIGHT_RAPID: f64 = 0.5;
/// Complexity weight for arcs (G2/G3).
const WEIGHT_ARC: f64 = 3.0;
/// Complexity weight for tool changes (M6).
const WEIGHT_TOOL_CHANGE: f64 = 5.0;
/// Complexity weight for coordinate-system changes (G54-G59).
const WEIGHT_COORDINATE_CHANGE: f64 = 2.0;

/// Operation class of a single program line, as far as chunk sizing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Rapid positioning move (G0).
    Rapid,
    /// Linear feed move (G1).
    Linear,
    /// Arc move (G2/G3).
    Arc,
    /// Tool change (M6).
    ToolChange,
    /// Work coordinate system change (G54-G59).
    CoordinateChange,
    /// Anything else (modal setup, dwell, comments, ...).
    Other,
}

impl LineClass {
    /// Complexity weight of this operation class.
    pub fn weight(self) -> f64 {
        match self {
            LineClass::Rapid => WEIGHT_RAPID,
            LineClass::Linear => WEIGHT_LINEAR,
            LineClass::Arc => WEIGHT_ARC,
            LineClass::ToolChange => WEIGHT_TOOL_CHANGE,
            LineClass::CoordinateChange => WEIGHT_COORDINATE_CHANGE,
            LineClass::Other => 0.0,
        }
    }
}

/// Classify one program line by its dominant operation.
///
/// Tool changes and coordinate-system changes take precedence over motion
/// words on the same line since they dominate processing cost.
pub fn classify_line(line: &str) -> LineClass {
    let mut motion = LineClass::Other;

    for (letter, value) in words(line) {
        match (letter, value) {
            ('M', 6) => return LineClass::ToolChange,
            ('G', 54..=59) => return LineClass::CoordinateChange,
            ('G', 0) => motion = LineClass::Rapid,
            ('G', 1) => motion = LineClass::Linear,
            ('G', 2) | ('G', 3) => motion = LineClass::Arc,
            _ => {}
        }
    }

    motion
}

/// Iterate over `(letter, integer value)` words in a G-code line.
///
/// Handles both spaced (`G1 X10`) and packed (`G1X10`) forms; comments
/// (`;` to end of line, parenthesized inline) are skipped.
fn words(line: &str) -> impl Iterator<Item = (char, u32)> + '_ {
    let code = line.split(';').next().unwrap_or("");
    let mut chars = code.chars().peekable();
    let mut in_comment = false;

    std::iter::from_fn(move || {
        while let Some(c) = chars.next() {
            match c {
                '(' => in_comment = true,
                ')' => in_comment = false,
                _ if in_comment => {}
                'A'..='Z' | 'a'..='z' => {
                    let letter = c.to_ascii_uppercase();
                    let mut value = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_digit() || next == '.' || next == '-' {
                            value.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    // "G1.5" style fractional codes truncate to the integer part
                    let numeric = value
                        .split('.')
                        .next()
                        .and_then(|v| v.parse::<u32>().ok());
                    if let Some(n) = numeric {
                        return Some((letter, n));
                    }
                }
                _ => {}
            }
        }
        None
    })
}

/// True if the line is entirely a comment (`;` or parenthesized).
pub fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with(';') || (trimmed.starts_with('(') && trimmed.ends_with(')'))
}

/// True if the line carries an inline or full-line comment.
pub fn has_comment(line: &str) -> bool {
    line.contains(';') || line.contains('(')
}

/// True if the line marks a subprogram (M98 call, M99 return, or O-word).
pub fn is_subprogram_marker(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.starts_with('O') || trimmed.starts_with('o') {
        return trimmed.chars().nth(1).is_some_and(|c| c.is_ascii_digit());
    }
    words(line).any(|(letter, value)| letter == 'M' && (value == 98 || value == 99))
}

/// Per-chunk metadata derived from its lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Chunk contains at least one tool change.
    pub has_tool_change: bool,
    /// Chunk contains at least one coordinate-system change.
    pub has_coordinate_change: bool,
    /// Line-count-normalized weighted operation score.
    pub complexity: f64,
}

/// A contiguous, bounded slice of program lines; the unit of processing.
///
/// Immutable once produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based position in the chunk sequence.
    pub index: usize,
    /// First line of the chunk (1-based).
    pub start_line: usize,
    /// Last line of the chunk (1-based, inclusive).
    pub end_line: usize,
    /// Byte offset of the chunk start in the source file.
    pub byte_start: u64,
    /// Byte offset one past the chunk end.
    pub byte_end: u64,
    /// The program lines themselves, in source order.
    pub lines: Vec<String>,
    /// Derived metadata.
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Number of lines in this chunk.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Byte span of this chunk in the source file.
    pub fn byte_len(&self) -> u64 {
        self.byte_end.saturating_sub(self.byte_start)
    }
}

/// Accumulates lines until a chunk is full, then finalizes it.
#[derive(Debug)]
pub(crate) struct ChunkBuilder {
    index: usize,
    start_line: usize,
    byte_start: u64,
    lines: Vec<String>,
    weight_sum: f64,
    has_tool_change: bool,
    has_coordinate_change: bool,
}

impl ChunkBuilder {
    pub(crate) fn new(index: usize, start_line: usize, byte_start: u64) -> Self {
        Self {
            index,
            start_line,
            byte_start,
            lines: Vec::new(),
            weight_sum: 0.0,
            has_tool_change: false,
            has_coordinate_change: false,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        let class = classify_line(&line);
        self.weight_sum += class.weight();
        self.has_tool_change |= class == LineClass::ToolChange;
        self.has_coordinate_change |= class == LineClass::CoordinateChange;
        self.lines.push(line);
    }

    pub(crate) fn len(&self) -> usize {
        self.lines.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn finish(self, byte_end: u64) -> Chunk {
        let count = self.lines.len();
        let complexity = if count == 0 {
            0.0
        } else {
            self.weight_sum / count as f64
        };
        Chunk {
            index: self.index,
            start_line: self.start_line,
            end_line: self.start_line + count.saturating_sub(1),
            byte_start: self.byte_start,
            byte_end,
            lines: self.lines,
            metadata: ChunkMetadata {
                has_tool_change: self.has_tool_change,
                has_coordinate_change: self.has_coordinate_change,
                complexity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_motion_lines() {
        assert_eq!(classify_line("G0 X10 Y20"), LineClass::Rapid);
        assert_eq!(classify_line("G00 X10"), LineClass::Rapid);
        assert_eq!(classify_line("G1 X10 F500"), LineClass::Linear);
        assert_eq!(classify_line("G01X10Y5"), LineClass::Linear);
        assert_eq!(classify_line("G2 X1 Y1 I0.5 J0"), LineClass::Arc);
        assert_eq!(classify_line("G3 X0 Y0 R2"), LineClass::Arc);
    }

    #[test]
    fn classify_state_changes() {
        assert_eq!(classify_line("M6 T2"), LineClass::ToolChange);
        assert_eq!(classify_line("M06"), LineClass::ToolChange);
        assert_eq!(classify_line("G54"), LineClass::CoordinateChange);
        assert_eq!(classify_line("G59"), LineClass::CoordinateChange);
    }

    #[test]
    fn tool_change_dominates_motion() {
        // One line carrying both a motion word and M6 counts as a tool change
        assert_eq!(classify_line("G1 M6 T3"), LineClass::ToolChange);
    }

    #[test]
    fn classify_non_motion() {
        assert_eq!(classify_line(""), LineClass::Other);
        assert_eq!(classify_line("; comment only"), LineClass::Other);
        assert_eq!(classify_line("G90"), LineClass::Other);
        assert_eq!(classify_line("M3 S12000"), LineClass::Other);
        // G17 must not be confused with G1
        assert_eq!(classify_line("G17"), LineClass::Other);
    }

    #[test]
    fn comment_does_not_affect_class() {
        assert_eq!(classify_line("G90 ; G1 in a comment"), LineClass::Other);
        assert_eq!(classify_line("(G2 arc note) G1 X0"), LineClass::Linear);
    }

    #[test]
    fn comment_detection() {
        assert!(is_comment_line("; full line"));
        assert!(is_comment_line("(note)"));
        assert!(!is_comment_line("G1 X0 ; trailing"));
        assert!(has_comment("G1 X0 ; trailing"));
        assert!(!has_comment("G1 X0"));
    }

    #[test]
    fn subprogram_markers() {
        assert!(is_subprogram_marker("M98 P100"));
        assert!(is_subprogram_marker("M99"));
        assert!(is_subprogram_marker("O100"));
        assert!(!is_subprogram_marker("G1 X0"));
        assert!(!is_subprogram_marker("ORIGIN")); // not an O-word
    }

    #[test]
    fn builder_complexity_is_normalized() {
        let mut builder = ChunkBuilder::new(0, 1, 0);
        builder.push("G1 X0".into()); // 1.0
        builder.push("G0 X1".into()); // 0.5
        builder.push("G2 X2 I1".into()); // 3.0
        builder.push("M6 T1".into()); // 5.0

        let chunk = builder.finish(40);
        assert!((chunk.metadata.complexity - 9.5 / 4.0).abs() < f64::EPSILON);
        assert!(chunk.metadata.has_tool_change);
        assert!(!chunk.metadata.has_coordinate_change);
    }

    #[test]
    fn complexity_is_deterministic() {
        let build = || {
            let mut b = ChunkBuilder::new(0, 1, 0);
            for line in ["G0 X0", "G1 X1", "G54", "G3 X2 R1"] {
                b.push(line.into());
            }
            b.finish(30).metadata.complexity
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn builder_line_ranges() {
        let mut builder = ChunkBuilder::new(2, 11, 100);
        builder.push("G1 X0".into());
        builder.push("G1 X1".into());

        let chunk = builder.finish(120);
        assert_eq!(chunk.index, 2);
        assert_eq!(chunk.start_line, 11);
        assert_eq!(chunk.end_line, 12);
        assert_eq!(chunk.line_count(), 2);
        assert_eq!(chunk.byte_len(), 20);
    }
}
