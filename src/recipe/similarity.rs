//! 问题相似度：与词序无关、不区分大小写的词集合模糊匹配
//!
//! 中英文混合：包含 CJK 字符时用 jieba 分词，否则取 `[a-z0-9]+` 词元。
//! 分数 = 0.55 × 词集合比 + 0.25 × 部分匹配比 + 0.20 × 双向覆盖率，范围 0..=1。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;
use regex::Regex;

static JIEBA: OnceLock<Jieba> = OnceLock::new();
static WORD_RE: OnceLock<Regex> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

/// 小写并折叠空白
pub fn normalize_question(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 分词为去重后的词集合
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let norm = normalize_question(text);
    if norm.chars().any(is_cjk) {
        return jieba()
            .cut_for_search(&norm, true)
            .into_iter()
            .map(str::trim)
            .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
            .map(str::to_string)
            .collect();
    }
    let re = WORD_RE.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("valid regex"));
    re.find_iter(&norm).map(|m| m.as_str().to_string()).collect()
}

/// 两个问题的相似度，0..=1；规范化后完全相同为 1.0
pub fn similarity(query: &str, signature: &str) -> f64 {
    let q_norm = normalize_question(query);
    let s_norm = normalize_question(signature);
    if q_norm.is_empty() || s_norm.is_empty() {
        return 0.0;
    }
    if q_norm == s_norm {
        return 1.0;
    }

    let q_tokens = tokenize(&q_norm);
    let s_tokens = tokenize(&s_norm);
    if q_tokens.is_empty() || s_tokens.is_empty() {
        return 0.0;
    }

    let base = token_set_ratio(&q_tokens, &s_tokens);
    let extra = partial_token_set_ratio(&q_tokens, &s_tokens);

    let common = q_tokens.intersection(&s_tokens).count() as f64;
    let overlap = common / q_tokens.len() as f64;
    let coverage = common / s_tokens.len() as f64;
    let balance = overlap.min(coverage);

    0.55 * base + 0.25 * extra + 0.20 * balance
}

fn join(tokens: impl Iterator<Item = impl AsRef<str>>) -> String {
    tokens.map(|t| t.as_ref().to_string()).collect::<Vec<_>>().join(" ")
}

fn concat(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a} {b}"),
    }
}

/// 词集合比：比较交集与 交集+各自差集 的三种组合，取最大
fn token_set_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let sect = join(a.intersection(b));
    let diff_ab = join(a.difference(b));
    let diff_ba = join(b.difference(a));
    if !sect.is_empty() && (diff_ab.is_empty() || diff_ba.is_empty()) {
        return 1.0;
    }
    let left = concat(&sect, &diff_ab);
    let right = concat(&sect, &diff_ba);
    let mut best = strsim::normalized_levenshtein(&left, &right);
    if !sect.is_empty() {
        best = best
            .max(strsim::normalized_levenshtein(&sect, &left))
            .max(strsim::normalized_levenshtein(&sect, &right));
    }
    best
}

/// 部分匹配比：有共同词即满分，否则比较差集的最佳子串对齐
fn partial_token_set_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.intersection(b).next().is_some() {
        return 1.0;
    }
    partial_ratio(&join(a.iter()), &join(b.iter()))
}

fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long): (Vec<char>, Vec<char>) = if a.chars().count() <= b.chars().count() {
        (a.chars().collect(), b.chars().collect())
    } else {
        (b.chars().collect(), a.chars().collect())
    };
    if short.is_empty() {
        return 0.0;
    }
    let needle: String = short.iter().collect();
    (0..=long.len() - short.len())
        .map(|start| {
            let window: String = long[start..start + short.len()].iter().collect();
            strsim::normalized_levenshtein(&needle, &window)
        })
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_case_insensitive() {
        assert_eq!(similarity("Top 5 users by age", "Top 5 users by age"), 1.0);
        assert_eq!(similarity("top 5  users by AGE", "Top 5 users by age"), 1.0);
    }

    #[test]
    fn test_word_order_insensitive() {
        let s = similarity("users by age top 5", "Top 5 users by age");
        assert!(s >= 0.99, "score {s}");
    }

    #[test]
    fn test_related_questions_score_higher_than_unrelated() {
        let related = similarity("top 10 users by age", "Top 5 users by age");
        let unrelated = similarity("list open invoices", "Top 5 users by age");
        assert!(related >= 0.8, "related {related}");
        assert!(unrelated < 0.5, "unrelated {unrelated}");
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(similarity("", "anything"), 0.0);
        assert_eq!(similarity("!!!", "???"), 0.0);
    }

    #[test]
    fn test_tokenize_cjk() {
        let tokens = tokenize("按年龄排序的前五个用户");
        assert!(!tokens.is_empty());
        assert!(similarity("按年龄排序的前五个用户", "按年龄排序的前五个用户 ") == 1.0);
    }
}
