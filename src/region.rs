//! Damage tracking for captured frames.
//!
//! [`UpdatedRegion`] accumulates the rectangles of a frame that changed
//! since the consumer's previous capture. The controller clears it at the
//! start of each duplication and the per-adapter duplicators add the
//! areas they rewrote.

use crate::geometry::{Point, Rect};

/// An ordered set of non-empty rectangles describing changed frame areas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdatedRegion {
    rects: Vec<Rect>,
}

impl UpdatedRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rectangle to the region. Empty rectangles are ignored, and
    /// rectangles already covered by (or covering) an existing entry are
    /// coalesced rather than stored twice.
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|existing| existing.contains(rect)) {
            return;
        }
        self.rects.retain(|existing| !rect.contains(*existing));
        self.rects.push(rect);
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Bounding box of the region, empty when the region is empty.
    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, rect| acc.united(*rect))
    }

    pub fn translate(&mut self, offset: Point) {
        for rect in &mut self.rects {
            rect.translate(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_skips_empty_and_covered_rects() {
        let mut region = UpdatedRegion::new();
        region.add(Rect::default());
        assert!(region.is_empty());

        region.add(Rect::from_ltrb(0, 0, 100, 100));
        region.add(Rect::from_ltrb(10, 10, 20, 20));
        assert_eq!(region.rects().len(), 1);
    }

    #[test]
    fn add_drops_entries_covered_by_new_rect() {
        let mut region = UpdatedRegion::new();
        region.add(Rect::from_ltrb(10, 10, 20, 20));
        region.add(Rect::from_ltrb(30, 30, 40, 40));
        region.add(Rect::from_ltrb(0, 0, 100, 100));
        assert_eq!(region.rects(), &[Rect::from_ltrb(0, 0, 100, 100)]);
    }

    #[test]
    fn bounding_rect_spans_all_entries() {
        let mut region = UpdatedRegion::new();
        assert!(region.bounding_rect().is_empty());

        region.add(Rect::from_ltrb(0, 0, 10, 10));
        region.add(Rect::from_ltrb(90, 40, 100, 50));
        assert_eq!(region.bounding_rect(), Rect::from_ltrb(0, 0, 100, 50));
    }

    #[test]
    fn translate_shifts_every_entry() {
        let mut region = UpdatedRegion::new();
        region.add(Rect::from_ltrb(0, 0, 10, 10));
        region.translate(Point::new(5, -5));
        assert_eq!(region.rects(), &[Rect::from_ltrb(5, -5, 15, 5)]);
    }
}
