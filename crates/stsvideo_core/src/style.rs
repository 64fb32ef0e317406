//! Minimal CSS cascade (§4.1, §6): class/id/tag selectors, inline
//! `style="…"`, last-declaration-wins. Only the hyphen-prefixed
//! properties listed in §6 are meaningful to the rest of the compiler;
//! this module resolves the full declaration dictionary regardless and
//! leaves filtering to whoever consumes it.

use crate::error::CoreError;
use crate::markup::Node;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum SelectorKind {
    Tag(String),
    Class(String),
    Id(String),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub selectors: Vec<SelectorKind>,
    pub declarations: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Stylesheet {
    pub rules: Vec<Rule>,
}

pub fn parse_stylesheet(css: &str) -> Result<Stylesheet, CoreError> {
    let mut rules = Vec::new();
    let mut rest = css;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let open = rest.find('{').ok_or_else(|| CoreError::ParseSnippet {
            snippet: truncate(rest),
            message: "expected '{' after selector list".to_string(),
        })?;
        let selector_text = &rest[..open];
        let close = rest.find('}').ok_or_else(|| CoreError::ParseSnippet {
            snippet: truncate(rest),
            message: "unterminated rule body, missing '}'".to_string(),
        })?;
        let body = &rest[open + 1..close];

        let selectors = selector_text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_selector)
            .collect::<Result<Vec<_>, _>>()?;

        let declarations = parse_declarations(body);

        rules.push(Rule {
            selectors,
            declarations,
        });

        rest = &rest[close + 1..];
    }

    Ok(Stylesheet { rules })
}

fn truncate(s: &str) -> String {
    s.chars().take(40).collect()
}

fn parse_selector(s: &str) -> Result<SelectorKind, CoreError> {
    if let Some(name) = s.strip_prefix('.') {
        Ok(SelectorKind::Class(name.to_string()))
    } else if let Some(name) = s.strip_prefix('#') {
        Ok(SelectorKind::Id(name.to_string()))
    } else if !s.is_empty() {
        Ok(SelectorKind::Tag(s.to_string()))
    } else {
        Err(CoreError::ParseSnippet {
            snippet: s.to_string(),
            message: "empty selector".to_string(),
        })
    }
}

/// Parses `prop: value;` pairs. Splits each declaration on its first colon
/// so values like `filter: blur(8px)` or `-chromakey: #00ff00 0.2 0.1` are
/// kept intact.
pub fn parse_declarations(body: &str) -> Vec<(String, String)> {
    body.split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .filter_map(|d| {
            let (key, value) = d.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn selector_matches(selector: &SelectorKind, node: &Node) -> bool {
    match selector {
        SelectorKind::Tag(tag) => node.tag == *tag,
        SelectorKind::Class(class) => node.classes().contains(&class.as_str()),
        SelectorKind::Id(id) => node.id() == Some(id.as_str()),
    }
}

/// Resolves the cascade for a single element: every matching rule applies
/// its declarations in stylesheet source order (later wins per property),
/// then the element's own inline `style="…"` applies last.
pub fn resolve_style(node: &Node, sheet: &Stylesheet) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    for rule in &sheet.rules {
        if rule.selectors.iter().any(|s| selector_matches(s, node)) {
            for (k, v) in &rule.declarations {
                resolved.insert(k.clone(), v.clone());
            }
        }
    }

    if let Some(inline) = node.attr("style") {
        for (k, v) in parse_declarations(inline) {
            resolved.insert(k, v);
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup;

    #[test]
    fn tag_selector_matches() {
        let sheet = parse_stylesheet("fragment { -duration: 2000ms; }").unwrap();
        let node = markup::parse(r#"<fragment data-asset="x" />"#).unwrap();
        let resolved = resolve_style(&node, &sheet);
        assert_eq!(resolved.get("-duration").map(String::as_str), Some("2000ms"));
    }

    #[test]
    fn class_selector_matches() {
        let sheet = parse_stylesheet(".title { -object-fit: cover; }").unwrap();
        let node = markup::parse(r#"<fragment class="title" />"#).unwrap();
        let resolved = resolve_style(&node, &sheet);
        assert_eq!(resolved.get("-object-fit").map(String::as_str), Some("cover"));
    }

    #[test]
    fn id_selector_matches() {
        let sheet = parse_stylesheet("#hero { -overlay-left: -500ms; }").unwrap();
        let node = markup::parse(r#"<fragment id="hero" />"#).unwrap();
        let resolved = resolve_style(&node, &sheet);
        assert_eq!(
            resolved.get("-overlay-left").map(String::as_str),
            Some("-500ms")
        );
    }

    #[test]
    fn last_declaration_wins_across_rules() {
        let sheet = parse_stylesheet(
            "fragment { -duration: 1000ms; } .clip { -duration: 2000ms; }",
        )
        .unwrap();
        let node = markup::parse(r#"<fragment class="clip" />"#).unwrap();
        let resolved = resolve_style(&node, &sheet);
        assert_eq!(resolved.get("-duration").map(String::as_str), Some("2000ms"));
    }

    #[test]
    fn inline_style_overrides_stylesheet() {
        let sheet = parse_stylesheet("fragment { -duration: 1000ms; }").unwrap();
        let node = markup::parse(r#"<fragment style="-duration: 9000ms;" />"#).unwrap();
        let resolved = resolve_style(&node, &sheet);
        assert_eq!(resolved.get("-duration").map(String::as_str), Some("9000ms"));
    }

    #[test]
    fn comma_separated_selectors_both_match() {
        let sheet = parse_stylesheet(".a, .b { -overlay-start-z-index: 5; }").unwrap();
        let a = markup::parse(r#"<fragment class="a" />"#).unwrap();
        let b = markup::parse(r#"<fragment class="b" />"#).unwrap();
        assert_eq!(
            resolve_style(&a, &sheet).get("-overlay-start-z-index"),
            Some(&"5".to_string())
        );
        assert_eq!(
            resolve_style(&b, &sheet).get("-overlay-start-z-index"),
            Some(&"5".to_string())
        );
    }

    #[test]
    fn unterminated_rule_reports_error() {
        let err = parse_stylesheet(".a { -duration: 1000ms;").unwrap_err();
        assert!(matches!(err, CoreError::ParseSnippet { .. }));
    }
}
