pub const DEFAULT_COLOR: &str = "ffffff";

/// Display colors are exactly six lowercase hex digits.
pub fn is_valid_color(color: &str) -> bool {
  color.len() == 6
    && color
      .chars()
      .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
