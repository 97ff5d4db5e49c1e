/// One contiguous slice of the remote resource, owned by a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub index: usize,
    /// First byte of the range as planned.
    pub origin: u64,
    /// First byte still to fetch (`origin` plus what a previous run persisted).
    pub start: u64,
    /// Last byte, inclusive. `None` when the resource length is unknown.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Bytes of this range already on disk.
    pub fn persisted(&self) -> u64 {
        self.start - self.origin
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.end, Some(end) if self.start > end)
    }

    /// Bytes still to fetch, if the end is known.
    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| (end + 1).saturating_sub(self.start))
    }

    /// Value for the `Range` request header, `None` when the whole resource is wanted.
    pub fn header_value(&self) -> Option<String> {
        match self.end {
            Some(end) => Some(format!("bytes={}-{}", self.start, end)),
            None if self.start > 0 => Some(format!("bytes={}-", self.start)),
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub ranges: Vec<ByteRange>,
    pub concurrency: usize,
}

impl Plan {
    /// Bytes credited from a previous run.
    pub fn resumed_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::persisted).sum()
    }
}

/// Number of workers that will actually run.
///
/// A server without byte-range support, or a resource of unknown length, gets a single
/// worker. Otherwise the request is clamped so that every range holds at least one byte.
pub fn effective_concurrency(
    content_length: Option<u64>,
    supports_partial: bool,
    requested: usize,
) -> usize {
    match content_length {
        Some(len) if supports_partial && len > 0 => {
            let cap = usize::try_from(len).unwrap_or(usize::MAX);
            requested.clamp(1, cap)
        }
        _ => 1,
    }
}

/// Splits the resource into disjoint ranges covering `[0, content_length)`.
///
/// Every range but the last has `content_length / n` bytes; the last one runs to the
/// final byte and absorbs the remainder. `persisted[i]` advances the start of range `i`
/// and is ignored when the server cannot serve partial content.
pub fn plan(
    content_length: Option<u64>,
    supports_partial: bool,
    requested: usize,
    persisted: &[u64],
) -> Plan {
    let concurrency = effective_concurrency(content_length, supports_partial, requested);
    let resumed = |index: usize| {
        if supports_partial {
            persisted.get(index).copied().unwrap_or(0)
        } else {
            0
        }
    };

    let total = match content_length {
        Some(len) if len > 0 => len,
        _ => {
            let start = resumed(0);
            return Plan {
                ranges: vec![ByteRange { index: 0, origin: 0, start, end: None }],
                concurrency,
            };
        }
    };

    let n = concurrency as u64;
    let part = total / n;
    let ranges = (0..concurrency)
        .map(|index| {
            let origin = index as u64 * part;
            let end = if index == concurrency - 1 {
                total - 1
            } else {
                origin + part - 1
            };
            let size = end - origin + 1;
            ByteRange {
                index,
                origin,
                start: origin + resumed(index).min(size),
                end: Some(end),
            }
        })
        .collect();

    Plan { ranges, concurrency }
}
