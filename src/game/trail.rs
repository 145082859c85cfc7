use super::constants::TRAIL_BUFFER_LEN;
use super::geometry::Point;

/// Fixed-length ring of predecessor positions. Each body segment owns one;
/// a position pushed this tick is released `TRAIL_BUFFER_LEN` ticks later,
/// which is what makes every segment trail its predecessor by a constant
/// delay.
#[derive(Debug, Clone)]
pub struct TrailBuffer {
  slots: Vec<Option<Point>>,
  index: usize,
}

impl TrailBuffer {
  pub fn new() -> Self {
    Self {
      slots: vec![None; TRAIL_BUFFER_LEN],
      index: 0,
    }
  }

  /// Stores `position` in the current slot and returns whatever the slot
  /// held before. Returns `None` while the buffer is still filling, so a
  /// freshly added segment sits still for the first `TRAIL_BUFFER_LEN`
  /// ticks.
  pub fn push(&mut self, position: Point) -> Option<Point> {
    let displaced = self.slots[self.index].replace(position);
    self.index += 1;
    if self.index >= self.slots.len() {
      self.index = 0;
    }
    displaced
  }
}

impl Default for TrailBuffer {
  fn default() -> Self {
    Self::new()
  }
}
