//! MIME-dispatched minify/beautify.
//!
//! Recording stores the beautified form so the inventory can be inspected
//! and edited by hand; playback optionally minifies when a resource's
//! `minify` flag is set. Only HTML, CSS and JavaScript family types are
//! optimized; everything else passes through minification unchanged, while
//! beautification of an unsupported type is an error.
//!
//! Minification dispatches to dedicated engines (minify-html for markup,
//! lightningcss for stylesheets); the JS minifier and the beautifiers are
//! in-crate, the registry carrying no counterpart to gohtml/jsbeautifier.

use std::str::FromStr;

use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, StyleSheet};

use crate::error::{Error, Result};

/// JavaScript brace placement for beautification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BraceStyle {
    /// Opening brace stays on the statement line.
    #[default]
    Collapse,
    /// Opening brace moves to its own line.
    Expand,
    /// Like collapse, but `}` gets its own line before `else`/`catch`.
    EndExpand,
}

impl FromStr for BraceStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collapse" => Ok(BraceStyle::Collapse),
            "expand" => Ok(BraceStyle::Expand),
            "end-expand" => Ok(BraceStyle::EndExpand),
            other => Err(Error::Format(format!("unknown brace style: {other}"))),
        }
    }
}

/// Beautification options.
#[derive(Debug, Clone)]
pub struct BeautifyOptions {
    pub indent_size: usize,
    pub indent_char: char,
    pub brace_style: BraceStyle,
    /// Prefix each HTML output line with its line number.
    pub add_line_numbers: bool,
}

impl Default for BeautifyOptions {
    fn default() -> Self {
        BeautifyOptions {
            indent_size: 2,
            indent_char: ' ',
            brace_style: BraceStyle::Collapse,
            add_line_numbers: false,
        }
    }
}

impl BeautifyOptions {
    fn indent(&self, level: usize) -> String {
        std::iter::repeat(self.indent_char)
            .take(self.indent_size * level)
            .collect()
    }
}

/// Size accounting for one optimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationStats {
    pub original_size: usize,
    pub optimized_size: usize,
    pub size_reduction: i64,
    /// optimized / original; 0 for empty input.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ContentFamily {
    Html,
    Css,
    Js,
}

fn family(content_type: &str) -> Option<ContentFamily> {
    let lowered = content_type.to_ascii_lowercase();
    if lowered.contains("html") {
        Some(ContentFamily::Html)
    } else if lowered.contains("css") {
        Some(ContentFamily::Css)
    } else if lowered.contains("javascript") || lowered.contains("ecmascript") {
        Some(ContentFamily::Js)
    } else {
        None
    }
}

/// Content optimizer dispatching on media type.
#[derive(Debug, Default)]
pub struct ContentOptimizer {
    options: BeautifyOptions,
}

impl ContentOptimizer {
    pub fn new() -> Self {
        ContentOptimizer::default()
    }

    pub fn with_options(options: BeautifyOptions) -> Self {
        ContentOptimizer { options }
    }

    /// Whether this content type is optimizable at all.
    pub fn accept(&self, content_type: &str) -> bool {
        family(content_type).is_some()
    }

    /// Minifies `content`. Unsupported types pass through unchanged; the
    /// result is never longer than the input.
    pub fn minify(&self, content_type: &str, content: &str) -> Result<String> {
        let result = match family(content_type) {
            Some(ContentFamily::Html) => minify_html_content(content),
            Some(ContentFamily::Css) => minify_css_content(content)?,
            Some(ContentFamily::Js) => minify_js_content(content),
            None => return Ok(content.to_string()),
        };
        // Never grow the body.
        if result.len() <= content.len() {
            Ok(result)
        } else {
            Ok(content.to_string())
        }
    }

    /// Beautifies `content`. Unsupported types are a format error.
    pub fn beautify(&self, content_type: &str, content: &str) -> Result<String> {
        match family(content_type) {
            Some(ContentFamily::Html) => Ok(beautify_html(content, &self.options)),
            Some(ContentFamily::Css) => Ok(beautify_css(content, &self.options)),
            Some(ContentFamily::Js) => Ok(beautify_js(content, &self.options)),
            None => Err(Error::Format(format!(
                "unsupported content type for beautification: {content_type}"
            ))),
        }
    }

    /// Size accounting for an optimization run.
    pub fn stats(&self, original: &str, optimized: &str) -> OptimizationStats {
        let original_size = original.len();
        let optimized_size = optimized.len();
        let compression_ratio = if original_size > 0 {
            optimized_size as f64 / original_size as f64
        } else {
            0.0
        };
        OptimizationStats {
            original_size,
            optimized_size,
            size_reduction: original_size as i64 - optimized_size as i64,
            compression_ratio,
        }
    }
}

/// Minifies markup with minify-html at its default, least invasive
/// settings (comments dropped, whitespace collapsed, CSS/JS left alone).
fn minify_html_content(content: &str) -> String {
    let minified = minify_html::minify(content.as_bytes(), &minify_html::Cfg::default());
    String::from_utf8_lossy(&minified).into_owned()
}

/// Minifies a stylesheet with lightningcss. Parse failures are format
/// errors; callers keep the stored body.
fn minify_css_content(content: &str) -> Result<String> {
    let mut stylesheet = StyleSheet::parse(content, ParserOptions::default())
        .map_err(|e| Error::Format(format!("CSS parse failed: {e}")))?;
    stylesheet
        .minify(MinifyOptions::default())
        .map_err(|e| Error::Format(format!("CSS minification failed: {e}")))?;
    let output = stylesheet
        .to_css(PrinterOptions {
            minify: true,
            ..PrinterOptions::default()
        })
        .map_err(|e| Error::Format(format!("CSS serialization failed: {e}")))?;
    Ok(output.code)
}

/// Conservative JavaScript minifier: drops comments and blank lines and
/// trims indentation, but keeps line structure so automatic semicolon
/// insertion is never disturbed.
fn minify_js_content(content: &str) -> String {
    let stripped = strip_js_comments(content);
    let lines: Vec<&str> = stripped
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

fn strip_js_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;
    let mut in_string: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 2;
                    continue;
                }
            }
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' | '`' => {
                in_string = Some(c);
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Void elements never take a closing tag and must not indent.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches(['<', '/'])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Re-indents markup one node per line.
fn beautify_html(content: &str, options: &BeautifyOptions) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut rest = content.trim();

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('<') {
            let end = match stripped.find('>') {
                Some(idx) => idx,
                None => {
                    lines.push(format!("{}{}", options.indent(depth), rest.trim()));
                    break;
                }
            };
            let tag = &rest[..end + 2];
            let closing = tag.starts_with("</");
            let declaration = tag.starts_with("<!") || tag.starts_with("<?");
            let self_closing = tag.ends_with("/>");
            let name = tag_name(tag);

            if closing {
                depth = depth.saturating_sub(1);
            }
            lines.push(format!("{}{}", options.indent(depth), tag.trim()));
            if !closing && !declaration && !self_closing && !VOID_ELEMENTS.contains(&name.as_str())
            {
                depth += 1;
            }
            rest = rest[end + 2..].trim_start();
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            let text = rest[..end].trim();
            if !text.is_empty() {
                lines.push(format!("{}{}", options.indent(depth), text));
            }
            rest = rest[end..].trim_start();
        }
    }

    if options.add_line_numbers {
        lines = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>3}  {}", i + 1, line))
            .collect();
    }
    lines.join("\n")
}

/// Formats CSS one declaration per line with braced blocks indented.
fn beautify_css(content: &str, options: &BeautifyOptions) -> String {
    let indent = options.indent(1);
    let mut out = String::with_capacity(content.len() * 2);
    let mut level: usize = 0;
    let mut in_comment = false;

    // Flatten first so the walk below owns all line structure.
    let mut flat = content.replace(['\n', '\r'], " ");
    while flat.contains("  ") {
        flat = flat.replace("  ", " ");
    }

    let chars: Vec<char> = flat.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '/' if chars.get(i + 1) == Some(&'*') => {
                in_comment = true;
                out.push(c);
            }
            '/' if i > 0 && chars.get(i - 1) == Some(&'*') => {
                in_comment = false;
                out.push(c);
            }
            '{' if !in_comment => {
                level += 1;
                out.push_str(" {\n");
                out.push_str(&indent.repeat(level));
            }
            '}' if !in_comment => {
                out.push('\n');
                level = level.saturating_sub(1);
                out.push_str(&indent.repeat(level));
                out.push_str("}\n");
                if level > 0 {
                    out.push_str(&indent.repeat(level));
                }
            }
            ';' if !in_comment => {
                out.push_str(";\n");
                out.push_str(&indent.repeat(level));
            }
            ' ' => {
                // Swallow spaces that follow structural breaks.
                if !matches!(out.chars().last(), Some('{' | ';' | '}' | '\n' | ' ') | None) {
                    out.push(' ');
                }
            }
            _ => out.push(c),
        }
    }

    let mut formatted = out.trim().to_string();
    while formatted.contains("\n\n\n") {
        formatted = formatted.replace("\n\n\n", "\n\n");
    }
    formatted
}

/// Formats JavaScript by brace depth, honoring the configured brace style.
fn beautify_js(content: &str, options: &BeautifyOptions) -> String {
    // Collapse the input onto one logical stream first.
    let flat: String = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let chars: Vec<char> = flat.chars().collect();
    let mut out = String::with_capacity(flat.len() * 2);
    let mut level: usize = 0;
    let mut paren_depth: usize = 0;
    let mut in_string: Option<char> = None;
    let mut i = 0;

    let newline = |out: &mut String, level: usize, options: &BeautifyOptions| {
        while out.ends_with(' ') {
            out.pop();
        }
        out.push('\n');
        out.push_str(&options.indent(level));
    };

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 2;
                    continue;
                }
            }
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' | '`' => {
                in_string = Some(c);
                out.push(c);
                i += 1;
            }
            '(' => {
                paren_depth += 1;
                out.push(c);
                i += 1;
            }
            ')' => {
                paren_depth = paren_depth.saturating_sub(1);
                out.push(c);
                i += 1;
            }
            '{' => {
                if options.brace_style == BraceStyle::Expand {
                    newline(&mut out, level, options);
                } else if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
                    out.push(' ');
                }
                out.push('{');
                level += 1;
                newline(&mut out, level, options);
                i += 1;
            }
            '}' => {
                level = level.saturating_sub(1);
                newline(&mut out, level, options);
                out.push('}');
                // Peek at what follows the block.
                let mut j = i + 1;
                while j < chars.len() && chars[j] == ' ' {
                    j += 1;
                }
                let ahead: String = chars[j.min(chars.len())..].iter().take(7).collect();
                let continuation = ["else", "catch", "finally", "while"]
                    .iter()
                    .any(|kw| ahead.starts_with(kw));
                if continuation && options.brace_style == BraceStyle::Collapse {
                    out.push(' ');
                } else {
                    newline(&mut out, level, options);
                }
                i = j;
            }
            ';' => {
                out.push(';');
                if paren_depth == 0 {
                    newline(&mut out, level, options);
                } else {
                    out.push(' ');
                }
                i += 1;
            }
            ' ' => {
                if !out.ends_with(' ') && !out.ends_with('\n') && !out.is_empty() {
                    out.push(' ');
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    // Drop trailing blank lines and indent-only lines.
    let cleaned: Vec<&str> = out.lines().map(str::trim_end).collect();
    let mut result = cleaned.join("\n");
    while result.contains("\n\n") {
        result = result.replace("\n\n", "\n");
    }
    result.trim().to_string()
}
