//! Typed parsing of the recognized hyphen-prefixed style properties (§6)
//! into the Fragment fields of §3. `style::resolve_style` only produces the
//! raw cascade dictionary; this module is where those string values become
//! `DurationSpec`, `StartSpec`, `ObjectFit`, and friends.

use crate::error::CoreError;
use crate::expr;
use crate::types::{ChromaKey, ContainMode, DurationSpec, EndBound, ObjectFit, StartSpec, Transition};

fn bad(value: &str, message: impl Into<String>) -> CoreError {
    CoreError::ParseSnippet {
        snippet: value.to_string(),
        message: message.into(),
    }
}

/// Parses a millisecond literal with optional `s`/`ms` unit suffix, or a
/// bare number (assumed milliseconds). Shared by every timing property.
pub fn parse_ms_literal(value: &str) -> Result<i64, CoreError> {
    let trimmed = value.trim();
    let (number, scale) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (trimmed, 1.0)
    };
    let parsed: f64 = number
        .trim()
        .parse()
        .map_err(|_| bad(value, "expected a millisecond value"))?;
    Ok((parsed * scale).round() as i64)
}

pub fn parse_duration(value: &str) -> Result<DurationSpec, CoreError> {
    let trimmed = value.trim();
    if trimmed == "100%" {
        return Ok(DurationSpec::FullSource);
    }
    if trimmed.starts_with("calc(") {
        return Ok(DurationSpec::Expr(expr::parse(trimmed)?));
    }
    Ok(DurationSpec::Literal(parse_ms_literal(trimmed)?))
}

pub fn parse_end_bound(value: &str) -> Result<EndBound, CoreError> {
    let trimmed = value.trim();
    if trimmed.starts_with("calc(") {
        return Ok(EndBound::Expr(expr::parse(trimmed)?));
    }
    Ok(EndBound::Literal(parse_ms_literal(trimmed)?))
}

pub fn parse_start(value: &str) -> Result<StartSpec, CoreError> {
    let trimmed = value.trim();
    if trimmed.starts_with("calc(") {
        return Ok(StartSpec::Expr(expr::parse(trimmed)?));
    }
    Ok(StartSpec::Literal(parse_ms_literal(trimmed)?))
}

/// `cover | contain [ambient <blur> <brightness> <saturation> | pillarbox <color>]`
pub fn parse_object_fit(value: &str) -> Result<ObjectFit, CoreError> {
    let mut tokens = value.split_whitespace();
    match tokens.next() {
        Some("cover") => Ok(ObjectFit::Cover),
        Some("contain") => match tokens.next() {
            None => Ok(ObjectFit::Contain(ContainMode::Letterbox)),
            Some("ambient") => {
                let blur = next_f64(&mut tokens, value)?;
                let brightness = next_f64(&mut tokens, value)?;
                let saturation = next_f64(&mut tokens, value)?;
                Ok(ObjectFit::Contain(ContainMode::Ambient {
                    blur,
                    brightness,
                    saturation,
                }))
            }
            Some("pillarbox") => {
                let color = tokens
                    .next()
                    .ok_or_else(|| bad(value, "pillarbox requires a color"))?
                    .to_string();
                Ok(ObjectFit::Contain(ContainMode::Pillarbox { color }))
            }
            Some(other) => Err(bad(value, format!("unknown contain sub-mode {other:?}"))),
        },
        Some(other) => Err(bad(value, format!("unknown object-fit value {other:?}"))),
        None => Err(bad(value, "empty object-fit value")),
    }
}

/// `<color> <similarity> <blend>`
pub fn parse_chromakey(value: &str) -> Result<ChromaKey, CoreError> {
    let mut tokens = value.split_whitespace();
    let color = tokens
        .next()
        .ok_or_else(|| bad(value, "chromakey requires a color"))?
        .to_string();
    let similarity = next_f64(&mut tokens, value)?;
    let blend = next_f64(&mut tokens, value)?;
    Ok(ChromaKey {
        color,
        similarity,
        blend,
    })
}

/// `<name> <duration>` e.g. `fade 500ms`.
pub fn parse_transition(value: &str) -> Result<Transition, CoreError> {
    let mut tokens = value.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| bad(value, "transition requires a name"))?
        .to_string();
    let duration_text = tokens
        .next()
        .ok_or_else(|| bad(value, "transition requires a duration"))?;
    Ok(Transition {
        name,
        duration_ms: parse_ms_literal(duration_text)?,
    })
}

/// `filter: blur(<px>)` — extracts the pixel radius as a gblur sigma.
pub fn parse_blur_filter(value: &str) -> Result<f64, CoreError> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix("blur(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| bad(value, "expected blur(<px>)"))?;
    let px_text = inner.trim().trim_end_matches("px");
    px_text
        .parse::<f64>()
        .map_err(|_| bad(value, "invalid blur radius"))
}

fn next_f64<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    original: &str,
) -> Result<f64, CoreError> {
    tokens
        .next()
        .ok_or_else(|| bad(original, "missing numeric argument"))?
        .parse::<f64>()
        .map_err(|_| bad(original, "expected a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_literal_variants() {
        assert_eq!(parse_ms_literal("500ms").unwrap(), 500);
        assert_eq!(parse_ms_literal("2.5s").unwrap(), 2500);
        assert_eq!(parse_ms_literal("750").unwrap(), 750);
        assert_eq!(parse_ms_literal("-500ms").unwrap(), -500);
    }

    #[test]
    fn duration_percent_and_literal() {
        assert!(matches!(parse_duration("100%").unwrap(), DurationSpec::FullSource));
        assert!(matches!(parse_duration("2000ms").unwrap(), DurationSpec::Literal(2000)));
        assert!(matches!(
            parse_duration("calc(1s + 1s)").unwrap(),
            DurationSpec::Expr(_)
        ));
    }

    #[test]
    fn object_fit_cover() {
        assert_eq!(parse_object_fit("cover").unwrap(), ObjectFit::Cover);
    }

    #[test]
    fn object_fit_contain_letterbox() {
        assert_eq!(
            parse_object_fit("contain").unwrap(),
            ObjectFit::Contain(ContainMode::Letterbox)
        );
    }

    #[test]
    fn object_fit_contain_ambient() {
        let fit = parse_object_fit("contain ambient 20 -0.1 0.5").unwrap();
        assert_eq!(
            fit,
            ObjectFit::Contain(ContainMode::Ambient {
                blur: 20.0,
                brightness: -0.1,
                saturation: 0.5,
            })
        );
    }

    #[test]
    fn object_fit_contain_pillarbox() {
        let fit = parse_object_fit("contain pillarbox #112233").unwrap();
        assert_eq!(
            fit,
            ObjectFit::Contain(ContainMode::Pillarbox {
                color: "#112233".to_string()
            })
        );
    }

    #[test]
    fn chromakey_parses_three_fields() {
        let ck = parse_chromakey("#00ff00 0.3 0.1").unwrap();
        assert_eq!(ck.color, "#00ff00");
        assert_eq!(ck.similarity, 0.3);
        assert_eq!(ck.blend, 0.1);
    }

    #[test]
    fn transition_parses_name_and_duration() {
        let t = parse_transition("fade 500ms").unwrap();
        assert_eq!(t.name, "fade");
        assert_eq!(t.duration_ms, 500);
    }

    #[test]
    fn blur_filter_strips_px_suffix() {
        assert_eq!(parse_blur_filter("blur(8px)").unwrap(), 8.0);
    }

    #[test]
    fn invalid_object_fit_errors() {
        assert!(parse_object_fit("zoom").is_err());
    }
}
