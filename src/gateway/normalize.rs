//! Source normalizer: turns raw model output into a bare script.
//!
//! Models routinely wrap code in markdown fences, sometimes several of
//! them with prose in between. The longest fenced block is taken as the
//! script; without fences the whole text is used. Any fence marker that
//! survives is stripped.

const FENCE: &str = "```";

/// Language hints accepted on the opening fence line.
const LANGUAGE_HINTS: &[&str] = &["python", "python3", "py"];

pub fn normalize(candidate: &str) -> String {
    let text = candidate.replace("\r\n", "\n");

    let code = match longest_fenced_block(&text) {
        Some(block) => block.trim().to_string(),
        None => text.trim().to_string(),
    };

    strip_stray_fences(&code).trim().to_string()
}

/// Returns the longest closed fenced block, first one winning ties.
fn longest_fenced_block(text: &str) -> Option<&str> {
    let parts: Vec<&str> = text.split(FENCE).collect();
    let mut best: Option<&str> = None;

    // Odd indices are inside a fence; the last part is never closed.
    for (i, part) in parts.iter().enumerate() {
        if i % 2 == 0 || i + 1 == parts.len() {
            continue;
        }
        let body = strip_language_hint(part);
        if best.map_or(true, |b| body.len() > b.len()) {
            best = Some(body);
        }
    }
    best
}

fn strip_language_hint(block: &str) -> &str {
    let (first_line, rest) = match block.find('\n') {
        Some(idx) => (&block[..idx], &block[idx + 1..]),
        None => (block, ""),
    };
    let hint = first_line.trim().to_ascii_lowercase();
    if hint.is_empty() || LANGUAGE_HINTS.contains(&hint.as_str()) {
        rest
    } else {
        block
    }
}

fn strip_stray_fences(code: &str) -> String {
    code.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.starts_with(FENCE)
                && LANGUAGE_HINTS
                    .iter()
                    .chain(std::iter::once(&""))
                    .any(|hint| trimmed[FENCE.len()..].eq_ignore_ascii_case(hint)))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
