//! Key names to DevTools key event fields

/// Fields of a key event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDefinition {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    /// Text the key produces, if any
    pub text: Option<String>,
}

// (names, key, code, windows key code, text)
const NAMED_KEYS: &[(&[&str], &str, &str, i64, Option<&str>)] = &[
    (&["enter", "return"], "Enter", "Enter", 13, Some("\r")),
    (&["tab"], "Tab", "Tab", 9, None),
    (&["escape", "esc"], "Escape", "Escape", 27, None),
    (&["backspace"], "Backspace", "Backspace", 8, None),
    (&["delete", "del"], "Delete", "Delete", 46, None),
    (&["space", "spacebar"], " ", "Space", 32, Some(" ")),
    (&["pageup"], "PageUp", "PageUp", 33, None),
    (&["pagedown"], "PageDown", "PageDown", 34, None),
    (&["home"], "Home", "Home", 36, None),
    (&["end"], "End", "End", 35, None),
    (&["arrowup", "up"], "ArrowUp", "ArrowUp", 38, None),
    (&["arrowdown", "down"], "ArrowDown", "ArrowDown", 40, None),
    (&["arrowleft", "left"], "ArrowLeft", "ArrowLeft", 37, None),
    (&["arrowright", "right"], "ArrowRight", "ArrowRight", 39, None),
];

/// Resolve a key name, case-insensitively. Single characters produce
/// themselves; unknown names are passed through as the key value.
pub fn key_definition(name: &str) -> KeyDefinition {
    let trimmed = name.trim();
    let folded: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect();

    if let Some((_, key, code, key_code, text)) = NAMED_KEYS
        .iter()
        .find(|(names, ..)| names.contains(&folded.as_str()))
    {
        return KeyDefinition {
            key: key.to_string(),
            code: code.to_string(),
            key_code: *key_code,
            text: text.map(String::from),
        };
    }

    let mut chars = trimmed.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        return char_key(ch);
    }

    KeyDefinition {
        key: trimmed.to_string(),
        code: trimmed.to_string(),
        key_code: 0,
        text: None,
    }
}

fn char_key(ch: char) -> KeyDefinition {
    let upper = ch.to_ascii_uppercase();
    let (code, key_code) = if ch.is_ascii_alphabetic() {
        (format!("Key{}", upper), upper as i64)
    } else if ch.is_ascii_digit() {
        (format!("Digit{}", ch), ch as i64)
    } else {
        (String::new(), 0)
    };
    KeyDefinition {
        key: ch.to_string(),
        code,
        key_code,
        text: Some(ch.to_string()),
    }
}
