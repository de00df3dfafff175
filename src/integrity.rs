//! Rolling integrity: XOR of keyed block digests over every swapped block of an image.
//!
//! XOR is commutative and self-inverse, so the value does not depend on iteration order and
//! one block's contribution can be exchanged without rehashing the others:
//! `replace(build(x), i, x[i], y) == build(x with x[i] = y)`.
//! This is a flat accumulator, there are no intermediate nodes.

use crate::{
    Error, Flash,
    hash::{BlockHasher, Digest},
    media::{Media, View},
    skip::SkipBitmap,
};

/// Fold digests of `(index, contents)` pairs.
pub fn fold<'a>(
    hasher: &BlockHasher,
    blocks: impl IntoIterator<Item = (u16, &'a [u8])>,
) -> Digest {
    blocks
        .into_iter()
        .fold(Digest::ZERO, |acc, (index, contents)| {
            acc ^ hasher.digest(index, contents)
        })
}

/// Exchange the contribution of block `index` from `old` to `new`.
pub fn replace(
    hasher: &BlockHasher,
    current: Digest,
    index: u16,
    old: &[u8],
    new: &[u8],
) -> Digest {
    current ^ hasher.digest(index, old) ^ hasher.digest(index, new)
}

/// Rolling integrity of the image seen through `view`, over all blocks not skipped.
pub async fn build<F: Flash, const B: usize>(
    media: &mut Media<'_, F, B>,
    hasher: &BlockHasher,
    skip: &SkipBitmap,
    count: u16,
    view: View,
) -> Result<Digest, Error> {
    let mut acc = Digest::ZERO;
    for index in skip.swapped(count) {
        let contents = media.read_view(view, index).await?;
        acc ^= hasher.digest(index, &contents);
    }
    Ok(acc)
}
