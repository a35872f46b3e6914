//! Question detection on agent output streams.
//!
//! Keeps a rolling window of recent lines and matches each new line against
//! a fixed pattern set: permission asks, confirmation phrasing, and explicit
//! trailing question marks. When an agent prints a bulleted or numbered list
//! immediately before the question, the list items become suggested answers.

use regex::Regex;
use std::collections::VecDeque;

/// A question spotted on the output stream, before it becomes a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedQuestion {
    pub text: String,
    pub suggested_answers: Vec<String>,
    /// The window contents at detection time, oldest first.
    pub context: Vec<String>,
}

/// Line-oriented matcher over one agent's output.
#[derive(Debug)]
pub struct QuestionDetector {
    window: VecDeque<String>,
    window_size: usize,
    patterns: Vec<Regex>,
}

impl QuestionDetector {
    pub fn new(window_size: usize) -> Self {
        let patterns = [
            r"(?i)\bdo you want\b",
            r"(?i)\bwould you like\b",
            r"(?i)\bshould i\b",
            r"(?i)\bpermission\b.*\?",
            r"(?i)\bproceed\b.*\?",
            r"(?i)\bplease (confirm|choose|select)\b",
            r"(?i)\b(yes/no|y/n)\b",
            r"\?\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        Self {
            window: VecDeque::new(),
            window_size: window_size.max(1),
            patterns,
        }
    }

    /// Feed one line; returns a detection when the line reads as a question.
    pub fn feed(&mut self, line: &str) -> Option<DetectedQuestion> {
        let trimmed = line.trim();
        let detected = if trimmed.is_empty() {
            None
        } else if self.patterns.iter().any(|p| p.is_match(trimmed)) {
            Some(DetectedQuestion {
                text: trimmed.to_string(),
                suggested_answers: extract_answers(&self.window),
                context: self.window.iter().cloned().collect(),
            })
        } else {
            None
        };

        self.window.push_back(line.to_string());
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        detected
    }
}

/// Collect the contiguous run of list items at the tail of the window.
fn extract_answers(window: &VecDeque<String>) -> Vec<String> {
    let mut answers: Vec<String> = Vec::new();
    for line in window.iter().rev() {
        match list_item(line) {
            Some(item) => answers.push(item),
            None => {
                if line.trim().is_empty() && answers.is_empty() {
                    continue;
                }
                break;
            }
        }
    }
    answers.reverse();
    answers
}

/// Parse a bulleted (`- x`, `* x`) or numbered (`1. x`, `2) x`) list line.
fn list_item(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
        return Some(rest.trim().to_string());
    }
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        let rest = &trimmed[digits.len()..];
        if let Some(item) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(item.trim().to_string());
        }
    }
    None
}
