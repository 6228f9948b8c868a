//! Base score and size-proximity tiers.

use super::config::{LanguagePreferences, ScoringWeights};
use super::types::ParsedRelease;

/// Share of the max size score awarded to the three releases closest to the ceiling.
const SIZE_TIERS: [f64; 3] = [1.0, 0.8, 0.6];

/// Scores parsed releases against configured weights.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
    languages: LanguagePreferences,
    uploader_terms: Vec<String>,
}

impl Scorer {
    pub fn new(
        weights: ScoringWeights,
        languages: LanguagePreferences,
        preferred_uploaders: &[String],
    ) -> Self {
        let uploader_terms = preferred_uploaders
            .iter()
            .flat_map(|group| group.split(','))
            .map(|term| term.trim().to_uppercase())
            .filter(|term| !term.is_empty())
            .collect();

        let languages = LanguagePreferences {
            include: languages.include.iter().map(|l| l.to_lowercase()).collect(),
            exclude: languages.exclude.iter().map(|l| l.to_lowercase()).collect(),
        };

        Self {
            weights,
            languages,
            uploader_terms,
        }
    }

    /// resolution + codec + capped seeders + uploader bonus + language terms.
    pub fn base_score(&self, parsed: &ParsedRelease) -> i64 {
        let resolution = parsed
            .resolution
            .and_then(|r| self.weights.resolution_scores.get(r.as_str()))
            .copied()
            .unwrap_or(0);

        let codec = parsed
            .codec
            .and_then(|c| self.weights.codec_scores.get(c.as_str()))
            .copied()
            .unwrap_or(0);

        let seeders = i64::from(parsed.seeders).min(self.weights.max_seeder_score.max(0));

        let uploader = if self.matches_preferred_uploader(&parsed.release_name) {
            self.weights.preferred_uploader_score
        } else {
            0
        };

        resolution + codec + seeders + uploader + self.language_score(&parsed.languages)
    }

    fn language_score(&self, languages: &[String]) -> i64 {
        let penalty = -self.weights.language_exclude_penalty.abs();
        languages.iter().fold(0, |acc, lang| {
            let mut score = acc;
            if self.languages.include.contains(lang) {
                score += self.weights.language_include_score;
            }
            if self.languages.exclude.contains(lang) {
                score += penalty;
            }
            score
        })
    }

    /// Uploader tags match as "-TAG", ".TAG", "[TAG]" or a standalone word.
    pub fn matches_preferred_uploader(&self, release_name: &str) -> bool {
        if self.uploader_terms.is_empty() {
            return false;
        }
        let upper = release_name.to_uppercase();
        let words: Vec<&str> = upper.split(|c: char| !c.is_alphanumeric()).collect();

        self.uploader_terms.iter().any(|term| {
            tag_follows(&upper, '-', term)
                || tag_follows(&upper, '.', term)
                || upper.contains(&format!("[{}]", term))
                || words.iter().any(|w| *w == term.as_str())
        })
    }

    pub fn max_size_score(&self) -> i64 {
        self.weights.max_size_score
    }
}

/// Whether `separator` + `term` occurs with no alphanumeric right after it.
fn tag_follows(name: &str, separator: char, term: &str) -> bool {
    let needle = format!("{}{}", separator, term);
    name.match_indices(&needle).any(|(start, _)| {
        name[start + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// Tiered size bonuses, aligned with `sizes`.
///
/// Releases are ordered by size, largest first. The first three at or under
/// `max_gb` get 100%, 80% and 60% of `max_size_score`; everything else gets
/// nothing. Unknown sizes never earn a bonus. Equal sizes keep input order.
pub fn size_bonuses(sizes: &[Option<f64>], max_gb: f64, max_size_score: i64) -> Vec<i64> {
    let mut order: Vec<usize> = (0..sizes.len()).filter(|&i| sizes[i].is_some()).collect();
    order.sort_by(|&a, &b| {
        let (sa, sb) = (sizes[a].unwrap_or(0.0), sizes[b].unwrap_or(0.0));
        sb.total_cmp(&sa)
    });

    let mut bonuses = vec![0; sizes.len()];
    let under_max = order
        .into_iter()
        .filter(|&i| sizes[i].is_some_and(|size| size <= max_gb));

    for (index, share) in under_max.zip(SIZE_TIERS) {
        bonuses[index] = (max_size_score as f64 * share).round() as i64;
    }

    bonuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::types::{CodecFamily, Resolution};

    fn scorer() -> Scorer {
        Scorer::new(
            ScoringWeights::default(),
            LanguagePreferences {
                include: vec!["IT".to_string()],
                exclude: vec!["ru".to_string()],
            },
            &["NTB, flux".to_string(), "RARBG".to_string()],
        )
    }

    #[test]
    fn test_size_tiers() {
        let sizes = [Some(9.5), Some(9.0), Some(8.0), Some(3.0)];
        assert_eq!(size_bonuses(&sizes, 10.0, 1000), vec![1000, 800, 600, 0]);
    }

    #[test]
    fn test_size_tiers_skip_oversized_and_unknown() {
        let sizes = [Some(12.0), None, Some(4.0), Some(10.0), Some(6.0)];
        assert_eq!(size_bonuses(&sizes, 10.0, 1000), vec![0, 0, 600, 1000, 800]);
    }

    #[test]
    fn test_size_tiers_order_independent() {
        let sizes = [Some(3.0), Some(8.0), Some(9.5), Some(9.0)];
        assert_eq!(size_bonuses(&sizes, 10.0, 1000), vec![0, 600, 1000, 800]);
    }

    #[test]
    fn test_base_score_components() {
        let parsed = ParsedRelease {
            release_name: "Film.2160p.x265-FLUX".to_string(),
            resolution: Some(Resolution::Uhd2160),
            codec: Some(CodecFamily::Hevc),
            seeders: 5000,
            languages: vec!["it".to_string(), "ru".to_string()],
            ..Default::default()
        };
        // 4000 + 500 + min(5000, 1000) + 500 + 300 - 1000
        assert_eq!(scorer().base_score(&parsed), 5300);
    }

    #[test]
    fn test_unknown_attributes_score_zero() {
        let parsed = ParsedRelease {
            release_name: "Mystery".to_string(),
            seeders: 7,
            ..Default::default()
        };
        assert_eq!(scorer().base_score(&parsed), 7);
    }

    #[test]
    fn test_uploader_separators() {
        let scorer = scorer();
        assert!(scorer.matches_preferred_uploader("Film.1080p.WEB-DL-NTB"));
        assert!(scorer.matches_preferred_uploader("Film.1080p.RARBG.mkv"));
        assert!(scorer.matches_preferred_uploader("[Flux] Film 1080p"));
        assert!(scorer.matches_preferred_uploader("Film 1080p NTB"));
        assert!(!scorer.matches_preferred_uploader("Film.1080p-NOTNTBX"));
    }

    #[test]
    fn test_uploader_tag_must_end_at_boundary() {
        let scorer = scorer();
        assert!(!scorer.matches_preferred_uploader("Film.1080p.RARBGX"));
        assert!(!scorer.matches_preferred_uploader("Film.1080p-NTBS.mkv"));
        assert!(scorer.matches_preferred_uploader("Film.1080p-NTB"));
        assert!(scorer.matches_preferred_uploader("Film.1080p.RARBG"));
    }

    #[test]
    fn test_positive_exclude_penalty_still_subtracts() {
        let weights = ScoringWeights {
            language_exclude_penalty: 250,
            ..Default::default()
        };
        let scorer = Scorer::new(
            weights,
            LanguagePreferences {
                include: vec![],
                exclude: vec!["fr".to_string()],
            },
            &[],
        );
        let parsed = ParsedRelease {
            languages: vec!["fr".to_string()],
            ..Default::default()
        };
        assert_eq!(scorer.base_score(&parsed), -250);
    }
}
