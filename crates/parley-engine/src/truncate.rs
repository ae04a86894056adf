pub const DEFAULT_MAX_OUTPUT: usize = 32 * 1024;

/// Truncate tool output if it exceeds `max_bytes`.
/// Truncates at a char boundary and appends a marker showing original vs truncated size.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let boundary = floor_char_boundary(output, max_bytes);
    let truncated = &output[..boundary];
    format!(
        "{truncated}\n\n[truncated: {} bytes -> {} bytes]",
        output.len(),
        boundary
    )
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
