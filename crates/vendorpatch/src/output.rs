//! Helpers for presenting child-process output: terminal-safe line
//! sanitizing and a bounded tail kept for error reports.

use std::collections::VecDeque;

const MAX_LINE_CHARS: usize = 4096;

/// Lines kept from a failing command for its error message.
pub const ERROR_TAIL_LINES: usize = 200;

/// Strip ANSI escape sequences, control characters and bidi overrides so
/// tool output can be echoed to a terminal or log file verbatim otherwise.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut chars = input.chars().peekable();
    let mut kept = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC / DCS / SOS / PM / APC: until BEL or ESC '\'.
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        match c {
            '\t' => out.push(' '),
            '\r' | '\n' => continue,
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// The last `cap` lines of a stream, with a count of what fell off the front.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    cap: usize,
    dropped: usize,
}

impl OutputTail {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line.into());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("... ({} earlier lines omitted)\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_title_sequences() {
        let got = sanitize_line("ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done");
        assert_eq!(got, "ok red  done");
    }

    #[test]
    fn strips_string_terminated_sequences() {
        assert_eq!(sanitize_line("a\u{1b}Ppayload\u{1b}\\b"), "ab");
    }

    #[test]
    fn drops_newlines_and_bidi_and_expands_tabs() {
        assert_eq!(sanitize_line("a\tb\nc\r\u{202e}x"), "a bcx");
    }

    #[test]
    fn tail_keeps_last_lines_and_counts_dropped() {
        let mut tail = OutputTail::new(2);
        for l in ["one", "two", "three"] {
            tail.push(l);
        }
        assert_eq!(tail.render(), "... (1 earlier lines omitted)\ntwo\nthree\n");
    }
}
