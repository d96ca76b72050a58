//! Bounded edit distance for typo-tolerant term matching.

/// Levenshtein distance between `a` and `b`, bounded by `max_distance`.
///
/// Returns `max_distance + 1` as soon as the distance is known to exceed
/// the bound: either the length difference alone is too large, or every
/// cell of the current DP row is already above it.
///
/// # Examples
///
/// ```
/// use segdex::fuzzy::levenshtein_distance;
///
/// assert_eq!(levenshtein_distance("kitten", "sitting", 5), 3);
/// assert_eq!(levenshtein_distance("kitten", "sitting", 1), 2);
/// ```
pub fn levenshtein_distance(a: &str, b: &str, max_distance: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let over = max_distance.saturating_add(1);

    if a.len().abs_diff(b.len()) > max_distance {
        return over;
    }
    if a.is_empty() || b.is_empty() {
        return a.len().max(b.len());
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ac) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];

        for (j, bc) in b.iter().enumerate() {
            let cost = usize::from(ac != bc);
            curr[j + 1] =
                (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
            row_min = row_min.min(curr[j + 1]);
        }

        if row_min > max_distance {
            return over;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[b.len()];
    if distance > max_distance { over } else { distance }
}

/// Edits tolerated for a term of `term_length` characters.
///
/// Terms of two characters or fewer never match fuzzily; short words
/// have too many one-edit neighbours.
pub fn get_max_edit_distance(term_length: usize) -> usize {
    match term_length {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

/// A vocabulary entry within edit distance of a query term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyMatch {
    pub term: String,
    pub distance: usize,
}

/// Vocabulary entries within the allowed distance of `term`, ordered by
/// distance and then lexicographically.
///
/// When `max_distance` is `None` the bound comes from
/// [`get_max_edit_distance`]. A resolved bound of zero returns only the
/// exact match, if present.
pub fn find_fuzzy_matches<'a, I>(
    term: &str,
    vocabulary: I,
    max_distance: Option<usize>,
) -> Vec<FuzzyMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    let max = max_distance
        .unwrap_or_else(|| get_max_edit_distance(term.chars().count()));

    let mut matches: Vec<FuzzyMatch> = vocabulary
        .into_iter()
        .filter_map(|candidate| {
            if candidate == term {
                return Some(FuzzyMatch {
                    term: candidate.to_string(),
                    distance: 0,
                });
            }
            if max == 0 {
                return None;
            }
            let distance = levenshtein_distance(term, candidate, max);
            (distance <= max).then(|| FuzzyMatch {
                term: candidate.to_string(),
                distance,
            })
        })
        .collect();

    matches.sort_by(|x, y| {
        x.distance.cmp(&y.distance).then_with(|| x.term.cmp(&y.term))
    });
    matches.dedup_by(|x, y| x.term == y.term);
    matches
}
