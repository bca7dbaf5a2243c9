//! Spatial rule binding a helmet region to a face.
//!
//! This is an approximate geometric heuristic, not an IoU test: a helmet
//! counts as worn when it overlaps the face horizontally and straddles the
//! face's top edge. Full containment is not required.

use crate::types::Rect;

/// True when `helmet` sits over the top edge of `face`.
pub fn covers(face: &Rect, helmet: &Rect) -> bool {
    let horizontal_overlap = !(helmet.right < face.left || helmet.left > face.right);
    let straddles_top = helmet.bottom > face.top && helmet.top < face.top;
    horizontal_overlap && straddles_top
}

/// First helmet region covering `face`, if any.
pub fn covering_helmet<'a, I>(face: &Rect, helmets: I) -> Option<&'a Rect>
where
    I: IntoIterator<Item = &'a Rect>,
{
    helmets.into_iter().find(|h| covers(face, h))
}

/// Whether any helmet region covers `face`. An empty list never does.
pub fn helmet_covers<'a, I>(face: &Rect, helmets: I) -> bool
where
    I: IntoIterator<Item = &'a Rect>,
{
    covering_helmet(face, helmets).is_some()
}
