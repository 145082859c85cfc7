#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
  pub x: f64,
  pub y: f64,
}

/// Axis-aligned rectangle, position at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
  pub x: f64,
  pub y: f64,
  pub w: f64,
  pub h: f64,
}

impl Rect {
  pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
    Self { x, y, w, h }
  }

  pub fn position(&self) -> Point {
    Point { x: self.x, y: self.y }
  }

  pub fn set_position(&mut self, position: Point) {
    self.x = position.x;
    self.y = position.y;
  }

  pub fn translated(&self, dx: f64, dy: f64) -> Rect {
    Rect {
      x: self.x + dx,
      y: self.y + dy,
      w: self.w,
      h: self.h,
    }
  }

  pub fn intersects(&self, other: &Rect) -> bool {
    self.x < other.x + other.w
      && self.x + self.w > other.x
      && self.y < other.y + other.h
      && self.y + self.h > other.y
  }
}
