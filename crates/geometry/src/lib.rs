//! Pixel-space geometry for render targets.
//!
//! Thin wrappers over `euclid` that carry a unit tag so that window pixels
//! and texel coordinates don't get mixed up by accident.

use std::ops::{Add, Sub};

pub use euclid::{Point2D as Point, Size2D as Extent, Vector2D as Offset};

/// Physical pixels of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Px;

/// Texels of a texture subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Texel;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect<T, U>(euclid::Box2D<T, U>);

impl<T, U> Rect<T, U> {
    pub fn new(origin: Point<T, U>, extent: Extent<T, U>) -> Self
    where
        T: Copy + Add<T, Output = T>,
    {
        Self(euclid::Box2D::from_origin_and_size(origin, extent))
    }

    /// A rectangle anchored at the origin that covers `extent`.
    pub fn from_extent(extent: Extent<T, U>) -> Self
    where
        T: Copy + Default + Add<T, Output = T>,
    {
        Self::new(Point::new(T::default(), T::default()), extent)
    }

    pub fn left(&self) -> T
    where
        T: Copy,
    {
        self.0.min.x
    }

    pub fn top(&self) -> T
    where
        T: Copy,
    {
        self.0.min.y
    }

    pub fn right(&self) -> T
    where
        T: Copy,
    {
        self.0.max.x
    }

    pub fn bottom(&self) -> T
    where
        T: Copy,
    {
        self.0.max.y
    }

    pub fn top_left(&self) -> Point<T, U>
    where
        T: Copy,
    {
        self.0.min
    }

    pub fn bottom_right(&self) -> Point<T, U>
    where
        T: Copy,
    {
        self.0.max
    }

    pub fn extent(&self) -> Extent<T, U>
    where
        T: Copy + Sub<T, Output = T>,
    {
        self.0.size()
    }

    pub fn is_empty(&self) -> bool
    where
        T: PartialOrd,
    {
        self.0.is_empty()
    }

    pub fn intersection(&self, rhs: &Rect<T, U>) -> Option<Rect<T, U>>
    where
        T: Copy + PartialOrd,
    {
        self.0.intersection(&rhs.0).map(Rect)
    }
}

/// The rasterizer's mapping from normalized device coordinates to the render
/// target, including the depth range written to the depth buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// A viewport that covers the whole target with the full `0..1` depth
    /// range.
    #[must_use]
    pub fn covering(extent: Extent<u32, Px>) -> Self {
        #[allow(clippy::cast_precision_loss)]
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// The smallest pixel rectangle that contains the viewport, clamped to
    /// `target`.
    #[must_use]
    pub fn scissor(&self, target: Extent<u32, Px>) -> Rect<u32, Px> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (left, top, right, bottom) = (
            self.x.max(0.0).floor() as u32,
            self.y.max(0.0).floor() as u32,
            ((self.x + self.width).ceil() as u32).min(target.width),
            ((self.y + self.height).ceil() as u32).min(target.height),
        );

        Rect(euclid::Box2D::new(
            Point::new(left, top),
            Point::new(right.max(left), bottom.max(top)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_edges() {
        let rect: Rect<u32, Px> = Rect::new(Point::new(2, 3), Extent::new(10, 20));
        assert_eq!(rect.left(), 2);
        assert_eq!(rect.top(), 3);
        assert_eq!(rect.right(), 12);
        assert_eq!(rect.bottom(), 23);
        assert_eq!(rect.extent(), Extent::new(10, 20));
    }

    #[test]
    fn rect_intersection() {
        let a: Rect<u32, Px> = Rect::new(Point::new(0, 0), Extent::new(10, 10));
        let b: Rect<u32, Px> = Rect::new(Point::new(5, 5), Extent::new(10, 10));
        let c: Rect<u32, Px> = Rect::new(Point::new(20, 20), Extent::new(1, 1));

        let ab = a.intersection(&b).unwrap();
        assert_eq!(ab.top_left(), Point::new(5, 5));
        assert_eq!(ab.bottom_right(), Point::new(10, 10));
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn viewport_covers_target() {
        let extent = Extent::new(1280, 720);
        let viewport = Viewport::covering(extent);
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, 720.0);
        assert_eq!(viewport.min_depth, 0.0);
        assert_eq!(viewport.max_depth, 1.0);

        let scissor = viewport.scissor(extent);
        assert_eq!(scissor, Rect::from_extent(extent));
    }

    #[test]
    fn scissor_is_clamped() {
        let viewport = Viewport {
            x: -4.0,
            y: 10.5,
            width: 100.0,
            height: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let scissor = viewport.scissor(Extent::new(64, 64));
        assert_eq!(scissor.left(), 0);
        assert_eq!(scissor.top(), 10);
        assert_eq!(scissor.right(), 64);
        assert_eq!(scissor.bottom(), 64);
    }
}
