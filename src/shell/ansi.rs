//! Terminal escape handling for captured output.

/// Strip ANSI escape codes from text.
/// Removes color codes, cursor movements, and other terminal control sequences.
pub fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\x1b' {
            result.push(ch);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameters until a final letter
                for next_ch in chars.by_ref() {
                    if next_ch.is_ascii_alphabetic() || next_ch == '~' {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: until BEL or ST (ESC \)
                while let Some(next_ch) = chars.next() {
                    if next_ch == '\x07' {
                        break;
                    }
                    if next_ch == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                // Two-byte escapes such as ESC = or ESC >
                chars.next();
            }
            None => {}
        }
    }

    result
}
