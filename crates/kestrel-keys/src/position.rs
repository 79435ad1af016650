/// Byte offset in `input` where the completed word starts.
///
/// On import lines a trailing comma or whitespace starts a fresh name; otherwise the
/// word is the trailing run of identifier characters.
pub fn complete_position(input: &str) -> usize {
    let trimmed = input.trim_start();
    if trimmed.starts_with("from ") || trimmed.starts_with("import ") {
        if let Some(last) = input.chars().last() {
            if last == ',' || last.is_whitespace() {
                return input.len();
            }
        }
    }

    input
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(input.len())
}
