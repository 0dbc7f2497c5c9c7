use std::collections::HashMap;

pub const MIN_SIMILARITY: f64 = 0.33;

/// Dice coefficient over padded, lower-cased character trigrams.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    let total: usize = left.values().sum::<usize>() + right.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = left
        .iter()
        .map(|(gram, count)| right.get(gram).map_or(0, |other| (*count).min(*other)))
        .sum();
    (2 * shared) as f64 / total as f64
}

/// The candidate most similar to `query`, if any reaches [`MIN_SIMILARITY`].
/// Ties keep the earliest candidate.
pub fn best_match<'a, I>(query: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let score = trigram_similarity(query, candidate);
        if score < MIN_SIMILARITY {
            continue;
        }
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((candidate, score));
        }
    }
    best.map(|(name, _)| name)
}

fn trigrams(value: &str) -> HashMap<String, usize> {
    let padded: Vec<char> = format!("-{}-", value.trim().to_lowercase())
        .chars()
        .collect();
    let mut grams = HashMap::new();
    for window in padded.windows(3) {
        *grams.entry(window.iter().collect::<String>()).or_insert(0) += 1;
    }
    grams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_one() {
        assert!((trigram_similarity("4xBox.pth", "4xbox.PTH") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn misspelling_resolves_to_closest_model() {
        let models = ["4xBox.pth", "1x_JPEG_60-80.pth", "4x_FatalPixels.pth"];
        assert_eq!(best_match("4xBxo.pth", models), Some("4xBox.pth"));
        assert_eq!(best_match("fatalpixels.pth", models), Some("4x_FatalPixels.pth"));
    }

    #[test]
    fn unrelated_query_matches_nothing() {
        assert_eq!(best_match("zzzz", ["4xBox.pth", "1x_JPEG.pth"]), None);
    }
}
