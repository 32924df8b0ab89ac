//! Markdown fence stripping for model-produced code.
//!
//! Models are asked to wrap code in triple-backtick blocks, optionally tagged
//! with a language. [`extract_code`] removes the outer fence and returns the
//! inner text. Stripping is repeated until nothing changes, which makes the
//! function idempotent even for degenerate inputs such as nested fences.

const FENCE: &str = "```";

/// Strips a surrounding code fence. `None` yields an empty string.
pub fn extract_code(text: Option<&str>) -> String {
    let mut current = match text {
        Some(text) => text.trim().to_string(),
        None => return String::new(),
    };

    loop {
        let next = strip_fence_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Language tag of the opening fence, lowercased, if one is present.
pub fn extract_fenced_language(text: &str) -> Option<String> {
    let rest = text.trim().strip_prefix(FENCE)?;
    let first_line = rest.split('\n').next().unwrap_or("").trim();
    if is_language_tag(first_line) {
        Some(first_line.to_ascii_lowercase())
    } else {
        None
    }
}

fn strip_fence_once(text: &str) -> String {
    let mut inner = text.trim();

    if let Some(rest) = inner.strip_prefix(FENCE) {
        inner = match rest.split_once('\n') {
            Some((first_line, remainder)) if first_line.trim().is_empty() => remainder,
            Some((first_line, remainder)) if is_language_tag(first_line.trim()) => remainder,
            None if is_language_tag(rest.trim()) => "",
            _ => rest,
        };
        inner = inner.trim();
    }

    if let Some(rest) = inner.strip_suffix(FENCE) {
        inner = rest.trim();
    }

    inner.to_string()
}

fn is_language_tag(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '#' | '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_fence() {
        assert_eq!(extract_code(Some("```python\nprint(1)\n```")), "print(1)");
    }

    #[test]
    fn test_none_is_empty() {
        assert_eq!(extract_code(None), "");
    }

    #[test]
    fn test_untagged_fence() {
        assert_eq!(extract_code(Some("  ```\nx = 1\ny = 2\n```  ")), "x = 1\ny = 2");
    }

    #[test]
    fn test_other_language_tags() {
        assert_eq!(extract_code(Some("```rust\nfn main() {}\n```")), "fn main() {}");
        assert_eq!(extract_code(Some("```c++\nint x;\n```")), "int x;");
    }

    #[test]
    fn test_no_fence_returns_trimmed_text() {
        assert_eq!(extract_code(Some("\n  print('hi')  \n")), "print('hi')");
    }

    #[test]
    fn test_inner_text_is_preserved() {
        let body = "def f(x):\n    return x * 2\n\n\nprint(f(3))";
        let fenced = format!("```python\n{}\n```", body);
        assert_eq!(extract_code(Some(&fenced)), body);
    }

    #[test]
    fn test_single_line_fence() {
        assert_eq!(extract_code(Some("```print(1)```")), "print(1)");
        assert_eq!(extract_code(Some("```python")), "");
    }

    #[test]
    fn test_idempotent_on_awkward_inputs() {
        let samples = [
            "",
            "```",
            "``````",
            "```\n```x```",
            "```python\n```python\nprint(1)\n```\n```",
            "text before\n```python\nprint(1)\n```",
            "   plain   ",
            "```py print(1)```",
            "```\n\n\n```",
        ];
        for sample in samples {
            let once = extract_code(Some(sample));
            let twice = extract_code(Some(&once));
            assert_eq!(once, twice, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_fenced_language() {
        assert_eq!(
            extract_fenced_language("```Python\nprint(1)\n```"),
            Some("python".to_string())
        );
        assert_eq!(extract_fenced_language("```\nprint(1)\n```"), None);
        assert_eq!(extract_fenced_language("print(1)"), None);
    }
}
