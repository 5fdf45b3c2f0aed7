use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sanitize::TextSanitizer;

/// Longest replacement template kept.
pub const MAX_REPLACE_LENGTH: usize = 1000;
/// Flags beyond this many characters are dropped.
pub const MAX_FLAGS_LENGTH: usize = 4;

/// Splits chat text into URL and non-URL spans.
pub static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+://(?:[^:/\[\]\s]+|\[[0-9a-f:]+\])(?::\d+)?(?:/[^/\s]*)*)")
        .expect("link pattern")
});

const AUTOLINK_TEMPLATE: &str = r#"<a href="${1}" target="_blank">${1}</a>"#;

/// Stored and wire form of a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    pub source: String,
    pub flags: String,
    pub replace: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub filterlinks: bool,
}

fn default_true() -> bool {
    true
}

/// A compiled regex substitution applied to chat text.
#[derive(Debug, Clone)]
pub struct ChatFilter {
    spec: FilterSpec,
    regex: Regex,
    global: bool,
    template: String,
}

impl ChatFilter {
    /// Compile a filter. Flags follow the client convention: `g` replaces
    /// every match, `i` ignores case, `m` is multi-line, `s` lets `.` match
    /// newlines.
    pub fn new(spec: FilterSpec) -> Result<Self, regex::Error> {
        let flags = &spec.flags;
        let regex = RegexBuilder::new(&spec.source)
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('s'))
            .build()?;
        Ok(Self {
            global: flags.contains('g'),
            template: convert_template(&spec.replace),
            regex,
            spec,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_active(&self) -> bool {
        self.spec.active
    }

    pub fn filters_links(&self) -> bool {
        self.spec.filterlinks
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.global {
            self.regex.replace_all(text, self.template.as_str())
        } else {
            self.regex.replace(text, self.template.as_str())
        }
    }
}

/// Rewrite a `$1`-style replacement into the regex crate's syntax, turning
/// any other `$` into a literal.
fn convert_template(replace: &str) -> String {
    let mut out = String::with_capacity(replace.len() + 8);
    let mut chars = replace.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(d) if d.is_ascii_digit() => {
                let mut group = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    group.push(d);
                    chars.next();
                    if group.len() == 2 {
                        break;
                    }
                }
                out.push_str(&format!("${{{group}}}"));
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            _ => out.push_str("$$"),
        }
    }
    out
}

/// Check a filter submitted by a member. Returns `None` when it is
/// malformed or its pattern does not compile.
pub fn validate_filter(data: &Value, sanitizer: &dyn TextSanitizer) -> Option<ChatFilter> {
    let source = data.get("source")?.as_str()?;
    let flags = data.get("flags")?.as_str()?;
    let replace = data.get("replace")?.as_str()?;
    let name = data
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .unwrap_or(source);

    let replace: String = replace.chars().take(MAX_REPLACE_LENGTH).collect();
    let spec = FilterSpec {
        name: name.to_string(),
        source: source.to_string(),
        flags: flags.chars().take(MAX_FLAGS_LENGTH).collect(),
        replace: sanitizer.sanitize_html(&replace),
        active: data.get("active").is_some_and(truthy),
        filterlinks: data.get("filterlinks").is_some_and(truthy),
    };
    ChatFilter::new(spec).ok()
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Formatting filters every room starts with.
pub fn default_filters() -> Vec<ChatFilter> {
    [
        ("monospace", "`(.+?)`", "g", "<code>$1</code>"),
        ("bold", r"\*(.+?)\*", "g", "<strong>$1</strong>"),
        ("italic", "_(.+?)_", "g", "<em>$1</em>"),
        ("strike", "~~(.+?)~~", "g", "<s>$1</s>"),
        (
            "inline spoiler",
            r"\[sp\](.*?)\[/sp\]",
            "ig",
            r#"<span class="spoiler">$1</span>"#,
        ),
    ]
    .into_iter()
    .filter_map(|(name, source, flags, replace)| {
        ChatFilter::new(FilterSpec {
            name: name.to_string(),
            source: source.to_string(),
            flags: flags.to_string(),
            replace: replace.to_string(),
            active: true,
            filterlinks: false,
        })
        .ok()
    })
    .collect()
}

/// The room's ordered filter list. Order is application order.
#[derive(Debug, Clone)]
pub struct FilterList {
    filters: Vec<ChatFilter>,
}

impl Default for FilterList {
    fn default() -> Self {
        Self {
            filters: default_filters(),
        }
    }
}

impl FilterList {
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatFilter> {
        self.filters.iter()
    }

    pub fn pack(&self) -> Vec<FilterSpec> {
        self.filters.iter().map(|f| f.spec.clone()).collect()
    }

    /// Replace the filter with the same name, or append it.
    pub fn update(&mut self, filter: ChatFilter) {
        match self.filters.iter_mut().find(|f| f.name() == filter.name()) {
            Some(existing) => *existing = filter,
            None => self.filters.push(filter),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ChatFilter> {
        let idx = self.filters.iter().position(|f| f.name() == name)?;
        Some(self.filters.remove(idx))
    }

    /// Move the filter at `from` so it ends up at index `to`.
    pub fn move_filter(&mut self, from: usize, to: usize) -> bool {
        if from >= self.filters.len() || to >= self.filters.len() {
            return false;
        }
        let filter = self.filters.remove(from);
        self.filters.insert(to, filter);
        true
    }

    /// Replace the whole list.
    pub fn import(&mut self, filters: Vec<ChatFilter>) {
        self.filters = filters;
    }

    /// Restore a list from its stored form. Entries that fail to compile
    /// are skipped.
    pub fn from_specs(specs: Vec<FilterSpec>) -> Self {
        let mut list = Self::empty();
        for spec in specs {
            if let Ok(filter) = ChatFilter::new(spec) {
                list.update(filter);
            }
        }
        list
    }

    /// Run chat text through the active filters.
    ///
    /// Text is split into URL and non-URL spans. Non-URL spans go through
    /// every active filter in order. URL spans only go through active
    /// link filters, and are turned into hyperlinks when none changed them.
    /// With `link_spans` off, URLs are treated as ordinary text.
    pub fn filter_message(&self, text: &str, link_spans: bool) -> String {
        if !link_spans {
            return self.apply_all(text, false);
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in LINK_RE.find_iter(text) {
            out.push_str(&self.apply_all(&text[last..m.start()], false));
            let url = m.as_str();
            let filtered = self.apply_all(url, true);
            if filtered == url {
                out.push_str(&LINK_RE.replace(url, AUTOLINK_TEMPLATE));
            } else {
                out.push_str(&filtered);
            }
            last = m.end();
        }
        out.push_str(&self.apply_all(&text[last..], false));
        out
    }

    fn apply_all(&self, span: &str, links_only: bool) -> String {
        let mut current = span.to_string();
        for filter in &self.filters {
            if !filter.is_active() || (links_only && !filter.filters_links()) {
                continue;
            }
            if let Cow::Owned(changed) = filter.apply(&current) {
                current = changed;
            }
        }
        current
    }
}
