use std::ops::Range;

use parking_lot::Mutex;

use crate::arch::Word;

/// A patched trap instruction plus the shadow of the bytes it replaced.
///
/// The shadow is the only owner of the original bytes; debugger writes that
/// land on the footprint go here instead of the live instruction stream.
#[derive(Debug)]
pub struct Breakpoint {
    address: Word,
    shadow: Mutex<Vec<u8>>,
}

impl Breakpoint {
    pub fn new(address: Word, original: Vec<u8>) -> Self {
        Self {
            address,
            shadow: Mutex::new(original),
        }
    }

    pub fn address(&self) -> Word {
        self.address
    }

    pub fn len(&self) -> usize {
        self.shadow.lock().len()
    }

    pub fn footprint(&self) -> Range<Word> {
        self.address..self.address + self.len() as Word
    }

    pub fn original(&self) -> Vec<u8> {
        self.shadow.lock().clone()
    }

    /// Replaces the part of `buffer` (which starts at `address`) that the
    /// patch covers with the saved original bytes.
    pub fn overlay(&self, address: Word, buffer: &mut [u8]) {
        let shadow = self.shadow.lock();
        if let Some((buf, shd)) = intersect(address, buffer.len(), self.address, shadow.len()) {
            buffer[buf].copy_from_slice(&shadow[shd]);
        }
    }

    /// Takes the part of `data` (which starts at `address`) that the patch
    /// covers into the shadow. Returns the absorbed range of `data`.
    pub fn absorb(&self, address: Word, data: &[u8]) -> Option<Range<usize>> {
        let mut shadow = self.shadow.lock();
        let (buf, shd) = intersect(address, data.len(), self.address, shadow.len())?;
        shadow[shd].copy_from_slice(&data[buf.clone()]);
        Some(buf)
    }
}

/// Intersection of `[a, a+alen)` and `[b, b+blen)` as index ranges into
/// each side.
fn intersect(a: Word, alen: usize, b: Word, blen: usize) -> Option<(Range<usize>, Range<usize>)> {
    let start = a.max(b);
    let end = (a + alen as Word).min(b + blen as Word);
    if start >= end {
        return None;
    }
    let n = (end - start) as usize;
    let ai = (start - a) as usize;
    let bi = (start - b) as usize;
    Some((ai..ai + n, bi..bi + n))
}
