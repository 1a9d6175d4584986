use std::ascii;

/// Escapes non-printable bytes so raw protocol lines can be logged safely.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}
