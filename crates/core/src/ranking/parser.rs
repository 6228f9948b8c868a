//! Release title parser.
//!
//! Titles look like:
//!
//! ```text
//! Show.S01E02.1080p.WEB-DL.x265-GROUP
//! 👤 42 💾 1.4 GB ⚙️ ThePirateBay
//! 🇬🇧 / 🇮🇹
//! ```
//!
//! The first line is the release name. Later lines may carry seeders (👤),
//! size (💾), tracker (⚙️) and language flags as regional-indicator pairs.

use once_cell::sync::Lazy;
use regex_lite::Regex;

use super::types::{CodecFamily, ParsedRelease, RawRelease, Resolution};

const SEEDERS_MARK: char = '\u{1F464}';
const SIZE_MARK: char = '\u{1F4BE}';
const SOURCE_MARK: char = '\u{2699}';
const VARIATION_SELECTOR: char = '\u{FE0F}';

const REGIONAL_INDICATOR_A: u32 = 0x1F1E6;
const REGIONAL_INDICATOR_Z: u32 = 0x1F1FF;

// Checked in order; the first hit wins.
const RESOLUTIONS: [(&str, Resolution); 5] = [
    ("2160p", Resolution::Uhd2160),
    ("1080p", Resolution::Fhd1080),
    ("720p", Resolution::Hd720),
    ("480p", Resolution::Sd480),
    ("4k", Resolution::Uhd2160),
];

const CODECS: [(&str, CodecFamily); 8] = [
    ("x265", CodecFamily::Hevc),
    ("hevc", CodecFamily::Hevc),
    ("h265", CodecFamily::Hevc),
    ("h.265", CodecFamily::Hevc),
    ("x264", CodecFamily::Avc),
    ("avc", CodecFamily::Avc),
    ("h264", CodecFamily::Avc),
    ("h.264", CodecFamily::Avc),
];

const QUALITY_TAGS: [&str; 9] = [
    "remux", "bluray", "blu-ray", "bdrip", "web-dl", "webrip", "web", "hdtv", "dvdrip",
];

static EPISODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bs(\d{1,2})[ ._-]?e(\d{1,3})\b|\b(\d{1,2})x(\d{2,3})\b")
        .expect("episode pattern is valid")
});

static SEASON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bseason[ ._-]*(\d{1,2})\b|\bs(\d{1,2})\b").expect("season pattern is valid")
});

static COMPLETE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcomplete[ ._\-\[(]*(\d{1,3})\b|\b(\d{1,3})[ ._-]*(?:episodes|eps)\b")
        .expect("pack count pattern is valid")
});

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([\d]+(?:[.,]\d+)?)\s*(TB|GB|MB|KB)").expect("size pattern is valid")
});

/// Parse a raw release into its attributes.
pub fn parse_release(raw: &RawRelease) -> ParsedRelease {
    let mut lines = raw.title.lines();
    let release_name = lines.next().unwrap_or_default().trim().to_string();
    let extra: Vec<&str> = lines.collect();

    // Everything the release name alone may not say.
    let mut haystack = release_name.to_lowercase();
    if let Some(ref filename) = raw.filename {
        haystack.push(' ');
        haystack.push_str(&filename.to_lowercase());
    }
    if let Some(ref name) = raw.name {
        haystack.push(' ');
        haystack.push_str(&name.to_lowercase());
    }

    let resolution = RESOLUTIONS
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, resolution)| *resolution);

    let codec = CODECS
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, codec)| *codec);

    let quality = QUALITY_TAGS
        .iter()
        .find(|tag| contains_token(&haystack, tag))
        .map(|tag| tag.replace("blu-ray", "bluray"));

    let metadata_line = extra
        .iter()
        .find(|line| line.contains(SEEDERS_MARK) || line.contains(SIZE_MARK))
        .copied()
        .unwrap_or_default();

    let seeders = raw
        .seeders
        .or_else(|| embedded_seeders(metadata_line))
        .unwrap_or(0);

    let size_gb = raw
        .size_bytes
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        .or_else(|| embedded_size_gb(metadata_line));

    let source = embedded_source(metadata_line);

    let languages = extra.iter().flat_map(|line| decode_flags(line)).fold(
        Vec::new(),
        |mut acc: Vec<String>, code| {
            if !acc.contains(&code) {
                acc.push(code);
            }
            acc
        },
    );

    let (season, episode) = season_episode(&release_name);
    let pack_episode_count = COMPLETE_RE.captures(&release_name).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok())
    });

    ParsedRelease {
        release_name,
        resolution,
        codec,
        quality,
        source,
        size_gb,
        seeders,
        languages,
        season,
        episode,
        is_season_pack: season.is_some() && episode.is_none(),
        pack_episode_count,
    }
}

/// Season and episode markers. A season without an episode means a pack.
fn season_episode(name: &str) -> (Option<u32>, Option<u32>) {
    if let Some(caps) = EPISODE_RE.captures(name) {
        let season = caps.get(1).or_else(|| caps.get(3));
        let episode = caps.get(2).or_else(|| caps.get(4));
        if let (Some(s), Some(e)) = (season, episode) {
            return (s.as_str().parse().ok(), e.as_str().parse().ok());
        }
    }

    let season = SEASON_RE.captures(name).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok())
    });
    (season, None)
}

fn embedded_seeders(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once(SEEDERS_MARK)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn embedded_size_gb(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once(SIZE_MARK)?;
    let segment = rest.split(SOURCE_MARK).next().unwrap_or(rest);
    let caps = SIZE_RE.captures(segment)?;
    let value: f64 = caps.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_uppercase();
    Some(to_gb(value, &unit))
}

fn embedded_source(line: &str) -> Option<String> {
    let (_, rest) = line.split_once(SOURCE_MARK)?;
    let source = rest.trim_start_matches(VARIATION_SELECTOR).trim();
    (!source.is_empty()).then(|| source.to_string())
}

/// Convert a size to GB. Unknown units count as zero.
pub fn to_gb(value: f64, unit: &str) -> f64 {
    match unit {
        "TB" => value * 1024.0,
        "GB" => value,
        "MB" => value / 1024.0,
        "KB" => value / (1024.0 * 1024.0),
        _ => 0.0,
    }
}

/// Decode regional-indicator pairs ("🇬🇧") into lowercase codes ("gb").
pub fn decode_flags(text: &str) -> Vec<String> {
    let mut codes = Vec::new();
    let mut pending: Option<char> = None;

    for c in text.chars() {
        let cp = c as u32;
        if !(REGIONAL_INDICATOR_A..=REGIONAL_INDICATOR_Z).contains(&cp) {
            pending = None;
            continue;
        }
        let letter = char::from(b'a' + (cp - REGIONAL_INDICATOR_A) as u8);
        match pending.take() {
            Some(first) => codes.push([first, letter].iter().collect()),
            None => pending = Some(letter),
        }
    }

    codes
}

/// Whole-token match, with tokens split on anything but letters, digits and '-'.
fn contains_token(haystack: &str, token: &str) -> bool {
    haystack
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .any(|part| part == token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrentio_title(name: &str, meta: &str, flags: &str) -> RawRelease {
        RawRelease::new("hash", format!("{}\n{}\n{}", name, meta, flags))
    }

    #[test]
    fn test_parses_embedded_metadata() {
        let raw = torrentio_title(
            "Dune.Part.Two.2024.2160p.WEB-DL.DDP5.1.x265-FLUX",
            "👤 1234 💾 9.5 GB ⚙️ ThePirateBay",
            "🇬🇧 / 🇮🇹",
        );
        let parsed = parse_release(&raw);

        assert_eq!(parsed.release_name, "Dune.Part.Two.2024.2160p.WEB-DL.DDP5.1.x265-FLUX");
        assert_eq!(parsed.resolution, Some(Resolution::Uhd2160));
        assert_eq!(parsed.codec, Some(CodecFamily::Hevc));
        assert_eq!(parsed.quality.as_deref(), Some("web-dl"));
        assert_eq!(parsed.seeders, 1234);
        assert_eq!(parsed.size_gb, Some(9.5));
        assert_eq!(parsed.source.as_deref(), Some("ThePirateBay"));
        assert_eq!(parsed.languages, vec!["gb".to_string(), "it".to_string()]);
        assert!(!parsed.is_season_pack);
    }

    #[test]
    fn test_structured_fields_win_over_embedded() {
        let raw = torrentio_title("Movie.1080p.x264", "👤 5 💾 700 MB ⚙️ 1337x", "")
            .with_seeders(99)
            .with_size_gb(2.0);
        let parsed = parse_release(&raw);
        assert_eq!(parsed.seeders, 99);
        assert!((parsed.size_gb.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_size_units() {
        assert_eq!(embedded_size_gb("💾 1.5 TB ⚙️ x"), Some(1536.0));
        assert_eq!(embedded_size_gb("💾 512 MB"), Some(0.5));
        assert_eq!(embedded_size_gb("💾 1048576 KB ⚙️ y"), Some(1.0));
        assert_eq!(embedded_size_gb("💾 1,5 GB"), Some(1.5));
        assert_eq!(embedded_size_gb("no size here"), None);
        assert_eq!(to_gb(3.0, "PB"), 0.0);
    }

    #[test]
    fn test_resolution_order_and_4k_alias() {
        let parsed = parse_release(&RawRelease::new("h", "Film 4K HDR"));
        assert_eq!(parsed.resolution, Some(Resolution::Uhd2160));

        // The explicit label is found before the alias.
        let parsed = parse_release(&RawRelease::new("h", "Film.4k.Remaster.1080p"));
        assert_eq!(parsed.resolution, Some(Resolution::Fhd1080));

        let parsed = parse_release(&RawRelease::new("h", "Film.DVDRip"));
        assert_eq!(parsed.resolution, None);
    }

    #[test]
    fn test_codec_families() {
        let cases = [
            ("a.HEVC", Some(CodecFamily::Hevc)),
            ("a.H265", Some(CodecFamily::Hevc)),
            ("a.H.264", Some(CodecFamily::Avc)),
            ("a.AVC", Some(CodecFamily::Avc)),
            ("a.XviD", None),
        ];
        for (title, expected) in cases {
            assert_eq!(parse_release(&RawRelease::new("h", title)).codec, expected, "{}", title);
        }
    }

    #[test]
    fn test_resolution_from_filename() {
        let raw = RawRelease::new("h", "Some Movie").with_filename("some.movie.720p.mkv");
        assert_eq!(parse_release(&raw).resolution, Some(Resolution::Hd720));
    }

    #[test]
    fn test_episode_markers() {
        let parsed = parse_release(&RawRelease::new("h", "Show.S02E05.720p"));
        assert_eq!((parsed.season, parsed.episode), (Some(2), Some(5)));
        assert!(!parsed.is_season_pack);

        let parsed = parse_release(&RawRelease::new("h", "Show 3x07 HDTV"));
        assert_eq!((parsed.season, parsed.episode), (Some(3), Some(7)));
    }

    #[test]
    fn test_season_pack_markers() {
        let parsed = parse_release(&RawRelease::new("h", "Show Season 1 Complete 10 1080p"));
        assert_eq!(parsed.season, Some(1));
        assert_eq!(parsed.episode, None);
        assert!(parsed.is_season_pack);
        assert_eq!(parsed.pack_episode_count, Some(10));

        let parsed = parse_release(&RawRelease::new("h", "Show.S03.1080p.BluRay.x265"));
        assert_eq!(parsed.season, Some(3));
        assert!(parsed.is_season_pack);
        assert_eq!(parsed.quality.as_deref(), Some("bluray"));
    }

    #[test]
    fn test_decode_flags_pairs_indicators() {
        assert_eq!(decode_flags("🇩🇪🇫🇷"), vec!["de".to_string(), "fr".to_string()]);
        assert_eq!(decode_flags("🇪 alone"), Vec::<String>::new());
        assert_eq!(decode_flags("Multi 🇪🇸 / 🇲🇽"), vec!["es".to_string(), "mx".to_string()]);
    }
}
