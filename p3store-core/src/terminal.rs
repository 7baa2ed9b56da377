/// Makes untrusted text safe to print on a terminal.
///
/// User ids come from imported certificates and may carry control characters
/// or ANSI escape sequences. Line breaks and tabs become spaces, every other
/// control character is shown as `\xNN` or `\u{N}`.
pub fn sanitize_for_terminal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' | '\r' | '\t' => out.push(' '),
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xFF {
                    out.push_str(&format!("\\x{code:02X}"));
                } else {
                    out.push_str(&format!("\\u{{{code:X}}}"));
                }
            }
            c => out.push(c),
        }
    }
    out
}
