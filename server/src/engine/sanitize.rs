use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Strips unsafe markup from member-supplied text.
pub trait TextSanitizer: Send + Sync {
    /// Escape everything; the result renders as plain text.
    fn sanitize_text(&self, text: &str) -> String;
    /// Keep a safe subset of HTML, dropping scripts and event handlers.
    fn sanitize_html(&self, html: &str) -> String;
    /// Reverse `sanitize_text`.
    fn decode_text(&self, text: &str) -> String;
}

const ALLOWED_TAGS: &[&str] = &[
    "a", "abbr", "b", "blockquote", "br", "code", "del", "div", "em", "font", "h1", "h2", "h3",
    "h4", "h5", "h6", "hr", "i", "img", "li", "ol", "p", "pre", "s", "small", "span", "strike",
    "strong", "sub", "sup", "table", "tbody", "td", "th", "thead", "tr", "u", "ul",
];

const ALLOWED_ATTRS: &[&str] = &[
    "alt", "class", "color", "height", "href", "src", "style", "target", "title", "width",
];

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("script pattern"));
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("style pattern"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(/?)([a-z][a-z0-9]*)\b([^>]*?)(/?)>").expect("tag pattern")
});
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*("[^"]*"|'[^']*'|[^\s"'>]+)"#)
        .expect("attribute pattern")
});

/// Regex-based whitelist sanitizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlSanitizer;

impl HtmlSanitizer {
    fn clean_tag(caps: &Captures<'_>) -> String {
        let closing = &caps[1];
        let name = caps[2].to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            return String::new();
        }
        if !closing.is_empty() {
            return format!("</{name}>");
        }

        let mut out = format!("<{name}");
        for attr in ATTR_RE.captures_iter(&caps[3]) {
            let key = attr[1].to_ascii_lowercase();
            if !ALLOWED_ATTRS.contains(&key.as_str()) {
                continue;
            }
            let raw = attr[2].trim_matches(|c| c == '"' || c == '\'');
            let compact: String = raw
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_lowercase();
            if compact.contains("javascript:")
                || compact.contains("vbscript:")
                || compact.contains("expression(")
            {
                continue;
            }
            let value = raw.replace('"', "&quot;");
            out.push_str(&format!(" {key}=\"{value}\""));
        }
        if !caps[4].is_empty() {
            out.push_str(" /");
        }
        out.push('>');
        out
    }
}

impl TextSanitizer for HtmlSanitizer {
    fn sanitize_text(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                '(' => out.push_str("&#40;"),
                ')' => out.push_str("&#41;"),
                c => out.push(c),
            }
        }
        out
    }

    fn sanitize_html(&self, html: &str) -> String {
        let without_scripts = SCRIPT_RE.replace_all(html, "");
        let without_styles = STYLE_RE.replace_all(&without_scripts, "");
        TAG_RE
            .replace_all(&without_styles, |caps: &Captures<'_>| Self::clean_tag(caps))
            .into_owned()
    }

    fn decode_text(&self, text: &str) -> String {
        text.replace("&#41;", ")")
            .replace("&#40;", "(")
            .replace("&#39;", "'")
            .replace("&quot;", "\"")
            .replace("&gt;", ">")
            .replace("&lt;", "<")
            .replace("&amp;", "&")
    }
}
