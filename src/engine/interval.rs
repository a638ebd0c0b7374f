//! Pure operations on half-open `[start, end)` spans.

use crate::model::Span;

pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

pub fn contains(outer: &Span, inner: &Span) -> bool {
    outer.contains_span(inner)
}

/// Sub-ranges of `window` not covered by any span in `busy`, in order.
/// `busy` may be unsorted and may overlap itself.
pub fn subtract(window: Span, busy: &[Span]) -> Vec<Span> {
    if busy.is_empty() {
        return vec![window];
    }
    let mut sorted = busy.to_vec();
    sorted.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&sorted);
    subtract_sorted(&[window], &merged)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Left-to-right sweep. Both inputs must be sorted by start and disjoint.
pub fn subtract_sorted(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
