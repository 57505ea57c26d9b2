//! The allocation bitmap of a reservoir.

/// One bit per reservoir block, indexed by `pbn - first`; a set bit means allocated
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AllocBitmap {
    first: u32,
    len: u32,
    bits: Vec<u8>,
}

impl AllocBitmap {
    /// Create a bitmap covering blocks `first..first + len`, all free
    pub fn new(first: u32, len: u32) -> Self {
        Self {
            first,
            len,
            bits: vec![0; len.div_ceil(8) as usize],
        }
    }

    fn index(&self, pbn: u32) -> Option<usize> {
        pbn.checked_sub(self.first)
            .filter(|&i| i < self.len)
            .map(|i| i as usize)
    }

    /// Is `pbn` tracked by this bitmap?
    pub fn contains(&self, pbn: u32) -> bool {
        self.index(pbn).is_some()
    }

    /// Returns `false` (and does nothing) if `pbn` lies outside the reservoir
    pub fn mark_allocated(&mut self, pbn: u32) -> bool {
        match self.index(pbn) {
            Some(i) => {
                self.bits[i / 8] |= 1 << (i % 8);
                true
            }
            None => false,
        }
    }

    /// Returns `false` (and does nothing) if `pbn` lies outside the reservoir
    pub fn mark_free(&mut self, pbn: u32) -> bool {
        match self.index(pbn) {
            Some(i) => {
                self.bits[i / 8] &= !(1 << (i % 8));
                true
            }
            None => false,
        }
    }

    /// Blocks outside the reservoir are never allocated
    pub fn is_allocated(&self, pbn: u32) -> bool {
        self.index(pbn)
            .is_some_and(|i| self.bits[i / 8] & (1 << (i % 8)) != 0)
    }

    pub fn count_allocated(&self) -> u32 {
        self.bits.iter().map(|x| x.count_ones()).sum()
    }

    pub fn count_free(&self) -> u32 {
        self.len - self.count_allocated()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Replace the bitmap content with a snapshot; bits past the end of the reservoir are
    /// ignored
    pub fn load(&mut self, bytes: &[u8]) {
        let n = std::cmp::min(bytes.len(), self.bits.len());
        self.bits.fill(0);
        self.bits[..n].copy_from_slice(&bytes[..n]);

        let tail = self.len % 8;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << tail) - 1;
            }
        }
    }
}
