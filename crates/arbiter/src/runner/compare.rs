//! Output comparison

use serde::{Deserialize, Serialize};

/// How a program's stdout is compared with the expected output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Strip one trailing `\n` or `\r\n` from each side, then compare exactly
    #[default]
    TrailingNewline,

    /// Byte-for-byte equality
    Exact,

    /// Ignore all trailing whitespace on each side
    TrailingWhitespace,
}

impl ComparisonPolicy {
    /// Whether `actual` is accepted as `expected`
    pub fn matches(self, actual: &[u8], expected: &[u8]) -> bool {
        match self {
            ComparisonPolicy::Exact => actual == expected,
            ComparisonPolicy::TrailingNewline => {
                strip_one_newline(actual) == strip_one_newline(expected)
            }
            ComparisonPolicy::TrailingWhitespace => {
                actual.trim_ascii_end() == expected.trim_ascii_end()
            }
        }
    }
}

fn strip_one_newline(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}
