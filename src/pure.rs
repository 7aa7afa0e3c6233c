// Pure Functions
// Deterministic helpers with no I/O: sorted identifier set algebra and lexeme
// prefix checks. These form the combine step of a query and are tested in isolation.

/// Set algebra over ascending, duplicate-free identifier sequences
pub mod sorted {
    /// Intersection of two ascending sequences
    ///
    /// Standard two-pointer merge: advance the smaller side on mismatch, emit on match.
    pub fn intersect(a: &[u32], b: &[u32]) -> Vec<u32> {
        let mut res = Vec::with_capacity(a.len().min(b.len()));
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i] == b[j] {
                res.push(a[i]);
                i += 1;
                j += 1;
            } else if a[i] < b[j] {
                i += 1;
            } else {
                j += 1;
            }
        }
        res
    }

    /// Union of two ascending sequences
    ///
    /// Emits whichever side is smaller, both once on a match, then the tail of
    /// whichever side is left over.
    pub fn union(a: &[u32], b: &[u32]) -> Vec<u32> {
        let mut res = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i] == b[j] {
                res.push(a[i]);
                i += 1;
                j += 1;
            } else if a[i] < b[j] {
                res.push(a[i]);
                i += 1;
            } else {
                res.push(b[j]);
                j += 1;
            }
        }
        res.extend_from_slice(&a[i..]);
        res.extend_from_slice(&b[j..]);
        res
    }

    /// Fold `intersect` left to right; empty input yields an empty set
    pub fn intersect_all<'a, I>(sets: I) -> Vec<u32>
    where
        I: IntoIterator<Item = &'a [u32]>,
    {
        fold(sets, intersect)
    }

    /// Fold `union` left to right; empty input yields an empty set
    pub fn union_all<'a, I>(sets: I) -> Vec<u32>
    where
        I: IntoIterator<Item = &'a [u32]>,
    {
        fold(sets, union)
    }

    fn fold<'a, I, F>(sets: I, op: F) -> Vec<u32>
    where
        I: IntoIterator<Item = &'a [u32]>,
        F: Fn(&[u32], &[u32]) -> Vec<u32>,
    {
        let mut iter = sets.into_iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        iter.fold(first.to_vec(), |acc, next| op(&acc, next))
    }

    /// Whether a sequence is strictly ascending
    pub fn is_strictly_ascending(ids: &[u32]) -> bool {
        ids.windows(2).all(|w| w[0] < w[1])
    }
}

/// Lexeme helpers shared by the builder and the query engine
pub mod lexeme {
    /// Whether any of `candidates` starts with `prefix`
    pub fn any_has_prefix<S: AsRef<str>>(candidates: &[S], prefix: &str) -> bool {
        candidates.iter().any(|c| c.as_ref().starts_with(prefix))
    }
}
