//! Lightweight markup → HTML rendering for card display fields.
//!
//! Highlights arrive as plain text with a small amount of Markdown-style
//! markup (emphasis, inline code, links, bullet lists). Cards are shown
//! as HTML, so the text is escaped and the common inline forms are
//! converted. Anything not recognised is kept as escaped text.

use std::sync::LazyLock;

use regex::Regex;

static MD_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("valid markdown link regex")
});
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s(])(https?://[^\s<)]+)").expect("valid bare url regex")
});
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid bold regex"));
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s][^*]*)\*").expect("valid emphasis regex"));
static CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("valid code regex"));

/// Escape the five HTML-significant characters.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render a block of highlight text as HTML.
///
/// Blank lines separate paragraphs. A paragraph whose every line starts
/// with `- ` or `* ` becomes an unordered list. Single newlines inside a
/// paragraph become `<br>`.
pub fn render_markup(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let normalized = trimmed.replace("\r\n", "\n");
    let mut blocks = Vec::new();

    for paragraph in normalized.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        let lines: Vec<&str> = paragraph.lines().map(str::trim).collect();
        let is_list = lines
            .iter()
            .all(|l| l.starts_with("- ") || l.starts_with("* "));

        if is_list {
            let items: String = lines
                .iter()
                .map(|l| format!("<li>{}</li>", render_inline(&l[2..])))
                .collect();
            blocks.push(format!("<ul>{}</ul>", items));
        } else {
            let body = lines
                .iter()
                .map(|l| render_inline(l))
                .collect::<Vec<_>>()
                .join("<br>");
            blocks.push(format!("<p>{}</p>", body));
        }
    }

    blocks.join("\n")
}

fn render_inline(line: &str) -> String {
    let escaped = escape_html(line);
    let with_links = MD_LINK.replace_all(&escaped, r#"<a href="$2">$1</a>"#);
    let with_urls = BARE_URL.replace_all(&with_links, r#"${1}<a href="${2}">${2}</a>"#);
    let with_code = CODE.replace_all(&with_urls, "<code>$1</code>");
    let with_bold = BOLD.replace_all(&with_code, "<strong>$1</strong>");
    EMPHASIS
        .replace_all(&with_bold, "<em>$1</em>")
        .into_owned()
}

/// Render a URL as a clickable anchor. Empty input renders as empty.
pub fn link(url: Option<&str>) -> String {
    match url.map(str::trim) {
        Some(u) if !u.is_empty() => {
            let escaped = escape_html(u);
            format!(r#"<a href="{0}">{0}</a>"#, escaped)
        }
        _ => String::new(),
    }
}

/// Render an image URL as an `<img>` tag. Empty input renders as empty.
pub fn image(url: Option<&str>) -> String {
    match url.map(str::trim) {
        Some(u) if !u.is_empty() => format!(r#"<img src="{}">"#, escape_html(u)),
        _ => String::new(),
    }
}
