//! Branch hints for the per-packet paths.

#[inline]
#[cold]
fn cold_path() {}

/// Marks `b == true` as the rare case, e.g. a drop or a blocked device.
#[inline]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold_path()
    }
    b
}
