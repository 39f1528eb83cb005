//! Recipe 工具名：规范化为 snake_case，同一 CacheKey 下去重

use std::sync::OnceLock;

use regex::Regex;

/// 工具名最大长度
pub const MAX_TOOL_NAME_LEN: usize = 40;

static NON_WORD_RE: OnceLock<Regex> = OnceLock::new();
static VALID_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// 文本 -> 安全的工具名：去标点、空白转下划线、截断到 40 字符，数字开头加 `r_`，空则为 "recipe"
pub fn sanitize_tool_name(text: &str) -> String {
    let re = NON_WORD_RE.get_or_init(|| Regex::new(r"[^a-z0-9_\s]").expect("valid regex"));
    let lowered = text.to_lowercase();
    let cleaned = re.replace_all(&lowered, "");
    let slug = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    let mut slug: String = slug.chars().take(MAX_TOOL_NAME_LEN).collect();
    slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        return "recipe".to_string();
    }
    if slug.starts_with(|c: char| c.is_ascii_digit()) {
        slug = format!("r_{slug}");
        slug.truncate(MAX_TOOL_NAME_LEN);
    }
    slug
}

/// 是否已是合法工具名（小写字母开头，至多 40 字符）
pub fn is_valid_tool_name(name: &str) -> bool {
    let re = VALID_NAME_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,39}$").expect("valid regex"));
    re.is_match(name)
}

/// 名称冲突时追加 _2、_3 …
pub fn deduplicate_tool_name<'a>(base: &str, taken: impl Iterator<Item = &'a str> + Clone) -> String {
    let mut name = base.to_string();
    let mut counter = 2;
    while taken.clone().any(|t| t == name) {
        name = format!("{base}_{counter}");
        counter += 1;
    }
    name
}
