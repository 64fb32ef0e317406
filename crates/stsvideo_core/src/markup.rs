//! Markup parser (§4.1): a hand-rolled recursive-descent reader for the
//! custom-element document format (`project, outputs, output, assets,
//! asset, sequence, fragment, container, app, ffmpeg, upload, style`).
//!
//! Produces a DOM-like tree that preserves source order and attribute
//! order. `<style>` and `<container>` bodies are opaque to this grammar —
//! their raw source text is the payload the rest of the compiler wants,
//! not a parsed substructure — so they are captured verbatim rather than
//! recursed into.

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    Element(Node),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Child>,
    pub line: usize,
    pub col: usize,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn children_of(&self, tag: &str) -> impl Iterator<Item = &Node> {
        self.children.iter().filter_map(move |c| match c {
            Child::Element(n) if n.tag == tag => Some(n),
            _ => None,
        })
    }

    /// Verbatim reconstruction of this element's children as source text,
    /// used for `<container>` bodies which are opaque to this grammar.
    pub fn raw_text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                Child::Text(t) => out.push_str(t),
                Child::Element(_) => {}
            }
        }
        out
    }
}

/// Tags whose bodies are captured as raw source text instead of being
/// recursed into as child elements.
const RAW_TEXT_TAGS: &[&str] = &["style", "container"];

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    source: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        let slice: String = self.chars[self.pos..]
            .iter()
            .take(s.chars().count())
            .collect();
        slice == s
    }

    fn consume_literal(&mut self, s: &str) -> bool {
        if self.starts_with(s) {
            for _ in s.chars() {
                self.advance();
            }
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> CoreError {
        CoreError::Parse {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }

    fn snippet_error(&self, message: impl Into<String>) -> CoreError {
        let start = self.pos.saturating_sub(20);
        let end = (self.pos + 20).min(self.chars.len());
        let snippet: String = self.chars[start..end].iter().collect();
        let _ = self.source;
        CoreError::ParseSnippet {
            snippet,
            message: message.into(),
        }
    }
}

pub fn parse(source: &str) -> Result<Node, CoreError> {
    let mut cursor = Cursor::new(source);
    cursor.skip_whitespace();
    skip_comments_and_whitespace(&mut cursor);
    let root = parse_element(&mut cursor)?;
    Ok(root)
}

fn skip_comments_and_whitespace(cursor: &mut Cursor) {
    loop {
        cursor.skip_whitespace();
        if cursor.starts_with("<!--") {
            while !cursor.starts_with("-->") && cursor.peek().is_some() {
                cursor.advance();
            }
            cursor.consume_literal("-->");
        } else {
            break;
        }
    }
}

fn parse_element(cursor: &mut Cursor) -> Result<Node, CoreError> {
    let line = cursor.line;
    let col = cursor.col;

    if cursor.advance() != Some('<') {
        return Err(cursor.error("expected '<' at start of element"));
    }

    let tag = parse_name(cursor)?;
    let attrs = parse_attrs(cursor)?;

    cursor.skip_whitespace();
    if cursor.consume_literal("/>") {
        return Ok(Node {
            tag,
            attrs,
            children: Vec::new(),
            line,
            col,
        });
    }
    if cursor.advance() != Some('>') {
        return Err(cursor.error(format!("expected '>' closing start tag <{tag}>")));
    }

    if RAW_TEXT_TAGS.contains(&tag.as_str()) {
        let closing = format!("</{tag}>");
        let mut text = String::new();
        while !cursor.starts_with(&closing) {
            match cursor.advance() {
                Some(c) => text.push(c),
                None => return Err(cursor.error(format!("unterminated element <{tag}>"))),
            }
        }
        cursor.consume_literal(&closing);
        return Ok(Node {
            tag,
            attrs,
            children: vec![Child::Text(text)],
            line,
            col,
        });
    }

    let mut children = Vec::new();
    loop {
        skip_comments_and_whitespace(cursor);
        let closing = format!("</{tag}>");
        if cursor.starts_with(&closing) {
            cursor.consume_literal(&closing);
            break;
        }
        if cursor.peek().is_none() {
            return Err(cursor.error(format!("unterminated element <{tag}>, missing </{tag}>")));
        }
        if cursor.starts_with("</") {
            return Err(cursor.snippet_error(format!("mismatched closing tag inside <{tag}>")));
        }
        if cursor.peek() == Some('<') {
            let child = parse_element(cursor)?;
            children.push(Child::Element(child));
        } else {
            let text = parse_text(cursor);
            if !text.trim().is_empty() {
                children.push(Child::Text(text));
            }
        }
    }

    Ok(Node {
        tag,
        attrs,
        children,
        line,
        col,
    })
}

fn parse_name(cursor: &mut Cursor) -> Result<String, CoreError> {
    let mut name = String::new();
    while matches!(cursor.peek(), Some(c) if c.is_alphanumeric() || c == '-' || c == '_') {
        name.push(cursor.advance().unwrap());
    }
    if name.is_empty() {
        return Err(cursor.error("expected element name"));
    }
    Ok(name)
}

fn parse_attrs(cursor: &mut Cursor) -> Result<Vec<(String, String)>, CoreError> {
    let mut attrs = Vec::new();
    loop {
        cursor.skip_whitespace();
        match cursor.peek() {
            Some('/') | Some('>') | None => break,
            _ => {}
        }
        let key = parse_attr_name(cursor)?;
        cursor.skip_whitespace();
        if cursor.peek() == Some('=') {
            cursor.advance();
            cursor.skip_whitespace();
            let value = parse_attr_value(cursor)?;
            attrs.push((key, value));
        } else {
            attrs.push((key, String::new()));
        }
    }
    Ok(attrs)
}

fn parse_attr_name(cursor: &mut Cursor) -> Result<String, CoreError> {
    let mut name = String::new();
    while matches!(cursor.peek(), Some(c) if c.is_alphanumeric() || c == '-' || c == '_' || c == ':') {
        name.push(cursor.advance().unwrap());
    }
    if name.is_empty() {
        return Err(cursor.error("expected attribute name"));
    }
    Ok(name)
}

fn parse_attr_value(cursor: &mut Cursor) -> Result<String, CoreError> {
    match cursor.peek() {
        Some(quote @ ('"' | '\'')) => {
            cursor.advance();
            let mut value = String::new();
            loop {
                match cursor.advance() {
                    Some(c) if c == quote => break,
                    Some(c) => value.push(c),
                    None => return Err(cursor.error("unterminated attribute value")),
                }
            }
            Ok(value)
        }
        Some(_) => {
            let mut value = String::new();
            while matches!(cursor.peek(), Some(c) if !c.is_whitespace() && c != '>' && c != '/') {
                value.push(cursor.advance().unwrap());
            }
            Ok(value)
        }
        None => Err(cursor.error("expected attribute value")),
    }
}

fn parse_text(cursor: &mut Cursor) -> String {
    let mut text = String::new();
    while matches!(cursor.peek(), Some(c) if c != '<') {
        text.push(cursor.advance().unwrap());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_preserving_order() {
        let doc = r#"<project>
            <assets>
                <asset data-name="clip" data-path="input/a.mp4" />
                <asset data-name="track" data-path="audio/b.mp3" data-type="audio" />
            </assets>
        </project>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.tag, "project");
        let assets = root.children_of("assets").next().unwrap();
        let names: Vec<&str> = assets
            .children_of("asset")
            .map(|n| n.attr("data-name").unwrap())
            .collect();
        assert_eq!(names, vec!["clip", "track"]);
    }

    #[test]
    fn preserves_attribute_order() {
        let doc = r#"<asset data-name="x" data-path="p" data-type="video" />"#;
        let root = parse(doc).unwrap();
        let keys: Vec<&str> = root.attrs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["data-name", "data-path", "data-type"]);
    }

    #[test]
    fn captures_style_block_verbatim() {
        let doc = r#"<project><style>.title { -duration: 2000ms; }</style></project>"#;
        let root = parse(doc).unwrap();
        let style = root.children_of("style").next().unwrap();
        assert_eq!(style.raw_text(), ".title { -duration: 2000ms; }");
    }

    #[test]
    fn captures_container_body_verbatim() {
        let doc = r#"<project><container id="title"><h1 class="big">Hello</h1></container></project>"#;
        let root = parse(doc).unwrap();
        let container = root.children_of("container").next().unwrap();
        assert_eq!(container.id(), Some("title"));
        assert_eq!(container.raw_text(), r#"<h1 class="big">Hello</h1>"#);
    }

    #[test]
    fn self_closing_element_has_no_children() {
        let doc = r#"<fragment data-asset="clip" />"#;
        let root = parse(doc).unwrap();
        assert!(root.children.is_empty());
    }

    #[test]
    fn bare_attribute_has_empty_value() {
        let doc = r#"<fragment data-asset="clip" enabled></fragment>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.attr("enabled"), Some(""));
    }

    #[test]
    fn comments_are_skipped() {
        let doc = r#"<project><!-- a comment --><assets></assets></project>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn unterminated_element_reports_parse_error() {
        let doc = r#"<project><assets>"#;
        let err = parse(doc).unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }));
    }

    #[test]
    fn mismatched_closing_tag_reports_snippet_error() {
        let doc = r#"<project><assets></wrong></project>"#;
        let err = parse(doc).unwrap_err();
        assert!(matches!(err, CoreError::ParseSnippet { .. } | CoreError::Parse { .. }));
    }

    #[test]
    fn class_list_splits_on_whitespace() {
        let doc = r#"<fragment class="big bold" />"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.classes(), vec!["big", "bold"]);
    }
}
