//! Title fingerprints: normalization, tokenization and token-set similarity.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::char::{decompose_canonical, is_combining_mark};
use unicode_normalization::UnicodeNormalization;

const NOISE_WORDS: &str = r"new|新品未使用|新品|未使用|中古品|中古|used|送料無料|free shipping|国内正規品|正規品|amazon\.co\.jp\s*(?:限定|exclusive)?|amazon\s*exclusive|限定|セール|sale|在庫あり|即納|あす楽|ポイント\s*\d+\s*倍|\d+\s*%\s*off";

static DEFAULT_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(&format!(r"[(\[【〔「<]\s*(?:{NOISE_WORDS})\s*[)\]】〕」>]"))
            .expect("valid bracketed noise regex"),
        Regex::new(r"送料無料|amazon\.co\.jp\s*exclusive|\bfree shipping\b|ポイント\s*\d+\s*倍|\b\d+\s*%\s*off\b|あす楽|即納")
            .expect("valid bare noise regex"),
    ]
});

static DEFAULT_NORMALIZER: LazyLock<TitleNormalizer> = LazyLock::new(TitleNormalizer::default);

/// Turns listing titles into comparable token sets.
#[derive(Debug, Clone)]
pub struct TitleNormalizer {
    noise: Vec<Regex>,
}

impl Default for TitleNormalizer {
    fn default() -> Self {
        Self {
            noise: DEFAULT_NOISE.clone(),
        }
    }
}

impl TitleNormalizer {
    /// Additional cosmetic patterns, matched against the lowercased NFKC title.
    pub fn with_extra_noise<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.noise.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn normalize(&self, title: &str) -> String {
        let mut text: String = title.nfkc().collect::<String>().to_lowercase();
        for pattern in &self.noise {
            text = pattern.replace_all(&text, " ").into_owned();
        }
        let text = strip_diacritics(&text);

        let chars: Vec<char> = text.chars().collect();
        let mut cleaned = String::with_capacity(text.len());
        for (i, &c) in chars.iter().enumerate() {
            let decimal_point = c == '.'
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if c.is_alphanumeric() || decimal_point {
                cleaned.push(c);
            } else {
                cleaned.push(' ');
            }
        }
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Whitespace tokens, split again where CJK meets other scripts; CJK runs become bigrams.
    pub fn tokens(&self, title: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for word in self.normalize(title).split_whitespace() {
            let mut run = String::new();
            let mut run_is_cjk = false;
            for c in word.chars() {
                let cjk = is_cjk(c);
                if !run.is_empty() && cjk != run_is_cjk {
                    push_run(&mut out, &run, run_is_cjk);
                    run.clear();
                }
                run_is_cjk = cjk;
                run.push(c);
            }
            if !run.is_empty() {
                push_run(&mut out, &run, run_is_cjk);
            }
        }
        out
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        jaccard(&self.tokens(a), &self.tokens(b))
    }
}

fn push_run(out: &mut BTreeSet<String>, run: &str, cjk: bool) {
    if !cjk {
        out.insert(run.to_string());
        return;
    }
    let chars: Vec<char> = run.chars().collect();
    if chars.len() == 1 {
        out.insert(run.to_string());
    } else {
        for pair in chars.windows(2) {
            out.insert(pair.iter().collect());
        }
    }
}

fn strip_diacritics(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if is_cjk(c) {
            // Kana voicing marks are combining marks too; keep them attached.
            out.push(c);
        } else {
            decompose_canonical(c, |d| {
                if !is_combining_mark(d) {
                    out.push(d);
                }
            });
        }
    }
    out
}

pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{FF66}'..='\u{FF9F}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// Jaccard index of two token sets; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Title similarity with the default normalizer.
pub fn similarity(a: &str, b: &str) -> f64 {
    DEFAULT_NORMALIZER.similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn same_camera_with_extra_word_clears_default_threshold() {
        let score = similarity("Sony A7 IV Body JP", "SONY A7 IV BODY JP Camera");
        assert!((score - 5.0 / 6.0).abs() < 1e-9);
        assert!(score >= 0.82);
    }

    #[test]
    fn different_generation_stays_below_threshold() {
        let score = similarity("Sony A7 IV", "Sony A7 III");
        assert!((score - 0.5).abs() < 1e-9);
        assert!(score < 0.82);
    }

    #[test]
    fn cosmetic_tags_are_stripped_before_scoring() {
        assert_eq!(similarity("(New) Sony A7 IV", "Sony A7 IV"), 1.0);
        assert_eq!(similarity("【新品】Sony A7 IV 送料無料", "Sony A7 IV"), 1.0);
        assert_eq!(similarity("Sony A7 IV [Amazon.co.jp限定]", "sony a7 iv"), 1.0);
        assert_eq!(similarity("Sony A7 IV ポイント10倍", "Sony A7 IV"), 1.0);
    }

    #[test]
    fn width_case_and_diacritics_fold() {
        assert_eq!(similarity("ＳＯＮＹ Ａ７", "sony a7"), 1.0);
        assert_eq!(similarity("Pokémon Scarlet", "pokemon scarlet"), 1.0);
    }

    #[test]
    fn punctuation_splits_but_decimal_points_survive() {
        let normalizer = TitleNormalizer::default();
        assert_eq!(
            normalizer.normalize("FE 24-70mm F2.8 GM II / SEL2470GM2"),
            "fe 24 70mm f2.8 gm ii sel2470gm2"
        );
    }

    #[test]
    fn cjk_runs_become_bigrams_and_split_from_latin() {
        let normalizer = TitleNormalizer::default();
        assert_eq!(
            normalizer.tokens("ソニーα7IV ボディ"),
            toks(&["ソニ", "ニー", "α7iv", "ボデ", "ディ"])
        );
        assert_eq!(normalizer.tokens("本 iPhone15"), toks(&["本", "iphone15"]));
        assert_eq!(normalizer.tokens("ガンダム"), toks(&["ガン", "ンダ", "ダム"]));
    }

    #[test]
    fn extra_noise_patterns_extend_defaults() {
        let normalizer = TitleNormalizer::default()
            .with_extra_noise([r"\bjp\b"])
            .unwrap();
        assert_eq!(normalizer.similarity("Sony A7 IV JP", "Sony A7 IV"), 1.0);
        assert!(TitleNormalizer::default().with_extra_noise(["("]).is_err());
    }

    #[test]
    fn jaccard_edges() {
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
        assert_eq!(jaccard(&toks(&["a", "b"]), &toks(&["a", "b"])), 1.0);
        assert_eq!(jaccard(&toks(&["a", "b"]), &toks(&["a", "c"])), 1.0 / 3.0);
    }
}
