//! Synthetic G-code programs for tests.

use std::fmt::Write;

/// Generate a deterministic G-code program with exactly `lines` lines.
///
/// The program mixes rapids, feed moves, arcs, tool changes, and
/// work-offset selections so analyzer metadata and complexity scores are
/// non-trivial. Every line is significant (no blanks), so line counts
/// survive default analyzer filtering.
pub fn synthetic_gcode(lines: usize) -> String {
    let mut out = String::with_capacity(lines * 24);
    for i in 0..lines {
        let x = (i % 200) as f64 * 0.5;
        let y = (i % 140) as f64 * 0.25;
        match i % 50 {
            0 => writeln!(out, "G0 X{x:.3} Y{y:.3} Z5.000"),
            13 => writeln!(out, "G2 X{x:.3} Y{y:.3} I1.000 J0.000 F800"),
            27 => writeln!(out, "M6 T{}", (i / 50) % 8 + 1),
            41 => writeln!(out, "G{}", 54 + (i / 50) % 6),
            _ => writeln!(out, "G1 X{x:.3} Y{y:.3} F1200"),
        }
        .expect("writing to a String cannot fail");
    }
    out
}
