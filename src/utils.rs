pub mod logging;

/// Shortens message bodies for log lines.
pub fn preview_text(value: &str) -> String {
    const MAX_CHARS: usize = 80;
    let mut preview: String = value.chars().take(MAX_CHARS).collect();
    if value.chars().count() > MAX_CHARS {
        preview.push('…');
    }
    preview.replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::preview_text;

    #[test]
    fn preview_text_truncates_and_flattens() {
        let long = "a".repeat(100);
        let preview = preview_text(&long);
        assert_eq!(preview.chars().count(), 81);
        assert!(preview.ends_with('…'));

        assert_eq!(preview_text("line one\nline two"), "line one line two");
    }
}
