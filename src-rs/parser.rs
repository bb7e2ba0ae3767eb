use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::ParseError;
use crate::geometry::{CoordinateSpace, ScreenRect};
use crate::model::{AnalysisReply, CalibrationResult, PositionOffset, PredictedStep, SizeCorrection};

const NUMBER: &str = r"[+-]?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?";

/// Text fields whose values may carry raw control characters from the model.
const TEXT_FIELDS: &[&str] = &["feedback", "message", "description", "text", "label"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPath {
    Direct,
    Repaired,
    Extracted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub recovery: RecoveryPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedResponse {
    Analysis(AnalysisReply),
    Calibration(CalibrationResult),
}

/// Parses either response kind, picking calibration when an accuracy score is present.
pub fn parse(raw: &str) -> Result<Parsed<ParsedResponse>, ParseError> {
    if let Some((value, recovery)) = decode_object(raw) {
        if value.get("accuracy_score").is_some() {
            if let Some(result) = calibration_from_value(&value) {
                return Ok(Parsed {
                    value: ParsedResponse::Calibration(result),
                    recovery,
                });
            }
        } else if let Some(reply) = analysis_from_value(&value) {
            return Ok(Parsed {
                value: ParsedResponse::Analysis(reply),
                recovery,
            });
        }
    }

    match extract_calibration(raw) {
        Some(result) => Ok(Parsed {
            value: ParsedResponse::Calibration(result),
            recovery: RecoveryPath::Extracted,
        }),
        None => Err(ParseError::unrecoverable(
            "no analysis steps, message or accuracy score",
            raw,
        )),
    }
}

pub fn parse_analysis(raw: &str) -> Result<Parsed<AnalysisReply>, ParseError> {
    let Some((value, recovery)) = decode_object(raw) else {
        return Err(ParseError::unrecoverable("no decodable JSON object", raw));
    };
    let reply = analysis_from_value(&value)
        .ok_or_else(|| ParseError::unrecoverable("missing steps and message", raw))?;
    if recovery != RecoveryPath::Direct {
        debug!("analysis response decoded after repair");
    }
    Ok(Parsed {
        value: reply,
        recovery,
    })
}

pub fn parse_calibration(raw: &str) -> Result<Parsed<CalibrationResult>, ParseError> {
    if let Some((value, recovery)) = decode_object(raw) {
        if let Some(result) = calibration_from_value(&value) {
            if recovery != RecoveryPath::Direct {
                debug!("calibration response decoded after repair");
            }
            return Ok(Parsed {
                value: result,
                recovery,
            });
        }
    }

    let result = extract_calibration(raw)
        .ok_or_else(|| ParseError::unrecoverable("missing accuracy_score", raw))?;
    warn!(
        "calibration response needed field extraction (score {:.2})",
        result.accuracy_score
    );
    Ok(Parsed {
        value: result,
        recovery: RecoveryPath::Extracted,
    })
}

/// The outermost object span with sign and control-character repairs applied.
/// Repairing an already repaired text returns it unchanged.
pub fn repair(raw: &str) -> Option<String> {
    json_span(raw).map(repair_span)
}

fn decode_object(raw: &str) -> Option<(Value, RecoveryPath)> {
    let span = json_span(raw)?;
    if let Ok(value) = serde_json::from_str::<Value>(span) {
        if value.is_object() {
            return Some((value, RecoveryPath::Direct));
        }
    }

    let repaired = repair_span(span);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) if value.is_object() => Some((value, RecoveryPath::Repaired)),
        Ok(_) => None,
        Err(err) => {
            debug!("repaired response still not JSON: {err}");
            None
        }
    }
}

fn json_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

fn repair_span(span: &str) -> String {
    escape_text_fields(&strip_plus_signs(span))
}

// Drops a `+` that directly prefixes a number in value position, ignoring
// anything inside string literals.
fn strip_plus_signs(span: &str) -> String {
    let chars: Vec<char> = span.chars().collect();
    let mut out = String::with_capacity(span.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut prev_significant: Option<char> = None;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                prev_significant = Some('"');
            }
            continue;
        }

        if ch == '"' {
            in_string = true;
            out.push(ch);
            continue;
        }

        let next_is_digit = chars.get(idx + 1).is_some_and(|next| next.is_ascii_digit());
        if ch == '+' && next_is_digit && matches!(prev_significant, Some(':' | ',' | '[')) {
            continue;
        }

        if !ch.is_whitespace() {
            prev_significant = Some(ch);
        }
        out.push(ch);
    }
    out
}

fn text_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = TEXT_FIELDS.join("|");
        Regex::new(&format!(r#""(?:{names})"\s*:\s*""#)).expect("text field pattern is valid")
    })
}

fn escape_text_fields(span: &str) -> String {
    let mut out = String::with_capacity(span.len() + 16);
    let mut cursor = 0;
    for found in text_field_regex().find_iter(span) {
        if found.start() < cursor {
            continue;
        }
        out.push_str(&span[cursor..found.end()]);
        let (body, consumed) = escape_string_body(&span[found.end()..]);
        out.push_str(&body);
        cursor = found.end() + consumed;
    }
    out.push_str(&span[cursor..]);
    out
}

// Copies one string body up to and including its closing quote, escaping raw
// control characters on the way.
fn escape_string_body(rest: &str) -> (String, usize) {
    let mut out = String::with_capacity(rest.len());
    let mut escaped = false;
    for (idx, ch) in rest.char_indices() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                return (out, idx + 1);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    (out, rest.len())
}

fn value_to_f64(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('+').parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn rect_from_value(value: &Value, space: CoordinateSpace) -> Option<ScreenRect> {
    Some(ScreenRect {
        x: value_to_f64(value.get("x"))?,
        y: value_to_f64(value.get("y"))?,
        width: value_to_f64(value.get("width"))?,
        height: value_to_f64(value.get("height"))?,
        space,
    })
}

fn step_from_value(index: usize, item: &Value) -> Option<PredictedStep> {
    let Some(rect) = rect_from_value(item, CoordinateSpace::Physical) else {
        debug!("skipping step {} without usable geometry", index + 1);
        return None;
    };
    Some(PredictedStep {
        id: value_to_string(item.get("id")).unwrap_or_else(|| format!("step-{}", index + 1)),
        label: value_to_string(item.get("text").or_else(|| item.get("label"))).unwrap_or_default(),
        rect,
        description: value_to_string(item.get("description")).unwrap_or_default(),
    })
}

fn analysis_from_value(value: &Value) -> Option<AnalysisReply> {
    let message = value_to_string(value.get("message"));
    let items = value.get("steps").and_then(Value::as_array);
    if message.is_none() && items.is_none() {
        return None;
    }
    let steps = items
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| step_from_value(idx, item))
                .collect()
        })
        .unwrap_or_default();
    Some(AnalysisReply {
        message: message.unwrap_or_default(),
        steps,
    })
}

fn calibration_from_value(value: &Value) -> Option<CalibrationResult> {
    let accuracy_score = value_to_f64(value.get("accuracy_score"))?.clamp(0.0, 1.0);
    let position_offset = value
        .get("position_offset")
        .map(|offset| PositionOffset {
            x: value_to_f64(offset.get("x")).unwrap_or(0.0),
            y: value_to_f64(offset.get("y")).unwrap_or(0.0),
        })
        .unwrap_or_default();
    let size_correction = value
        .get("size_correction")
        .map(|size| SizeCorrection {
            width: value_to_f64(size.get("width")).unwrap_or(0.0),
            height: value_to_f64(size.get("height")).unwrap_or(0.0),
        })
        .unwrap_or_default();
    let corrected_rect = value
        .get("corrected_position")
        .or_else(|| value.get("corrected_rect"))
        .and_then(|rect| rect_from_value(rect, CoordinateSpace::Logical));

    Some(CalibrationResult {
        accuracy_score,
        position_offset,
        size_correction,
        feedback: value_to_string(value.get("feedback")).unwrap_or_default(),
        corrected_rect,
    })
}

struct ExtractPatterns {
    accuracy: Regex,
    offset_block: Regex,
    size_block: Regex,
    x: Regex,
    y: Regex,
    width: Regex,
    height: Regex,
    feedback: Regex,
}

fn extract_patterns() -> &'static ExtractPatterns {
    static PATTERNS: OnceLock<ExtractPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let field = |name: &str| {
            Regex::new(&format!(r#""{name}"\s*:\s*"?({NUMBER})"#)).expect("field pattern is valid")
        };
        ExtractPatterns {
            accuracy: field("accuracy_score"),
            offset_block: Regex::new(r#""position_offset"\s*:\s*\{([^}]*)\}"#)
                .expect("offset pattern is valid"),
            size_block: Regex::new(r#""size_correction"\s*:\s*\{([^}]*)\}"#)
                .expect("size pattern is valid"),
            x: field("x"),
            y: field("y"),
            width: field("width"),
            height: field("height"),
            feedback: Regex::new(r#"(?s)"feedback"\s*:\s*"((?:[^"\\]|\\.)*)""#)
                .expect("feedback pattern is valid"),
        }
    })
}

fn capture_number(re: &Regex, text: &str) -> Option<f64> {
    let raw = re.captures(text)?.get(1)?.as_str();
    let number = raw.trim_start_matches('+').parse::<f64>().ok()?;
    number.is_finite().then_some(number)
}

/// Field-by-field salvage of a calibration reply that no longer decodes.
fn extract_calibration(raw: &str) -> Option<CalibrationResult> {
    let patterns = extract_patterns();
    let accuracy_score = capture_number(&patterns.accuracy, raw)?.clamp(0.0, 1.0);

    let position_offset = patterns
        .offset_block
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|block| PositionOffset {
            x: capture_number(&patterns.x, block.as_str()).unwrap_or(0.0),
            y: capture_number(&patterns.y, block.as_str()).unwrap_or(0.0),
        })
        .unwrap_or_default();
    let size_correction = patterns
        .size_block
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|block| SizeCorrection {
            width: capture_number(&patterns.width, block.as_str()).unwrap_or(0.0),
            height: capture_number(&patterns.height, block.as_str()).unwrap_or(0.0),
        })
        .unwrap_or_default();
    let feedback = patterns
        .feedback
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|body| unescape_feedback(body.as_str()))
        .unwrap_or_default();

    Some(CalibrationResult {
        accuracy_score,
        position_offset,
        size_correction,
        feedback,
        corrected_rect: None,
    })
}

fn unescape_feedback(body: &str) -> String {
    let (escaped, _) = escape_string_body(&format!("{body}\""));
    serde_json::from_str::<String>(&format!("\"{escaped}"))
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_json_inside_prose() {
        let raw = r#"Sure! Here is what I found:
{"message": "Click Save", "steps": [{"text": "Save", "x": 10, "y": 20, "width": 80, "height": 30, "description": "toolbar"}]}
Let me know if you need more."#;
        let parsed = parse_analysis(raw).unwrap();
        assert_eq!(parsed.recovery, RecoveryPath::Direct);
        assert_eq!(parsed.value.message, "Click Save");
        let step = &parsed.value.steps[0];
        assert_eq!(step.id, "step-1");
        assert_eq!(step.label, "Save");
        assert_eq!(step.rect, ScreenRect::physical(10.0, 20.0, 80.0, 30.0));
        assert_eq!(step.description, "toolbar");
    }

    #[test]
    fn steps_without_geometry_are_skipped() {
        let raw = r#"{"message": "m", "steps": [
            {"text": "a", "x": "12", "y": 4, "width": 50, "height": 20},
            {"text": "b", "x": null, "y": 4, "width": 50, "height": 20},
            {"id": 7, "text": "c", "x": 1, "y": 2, "width": 3, "height": 4}
        ]}"#;
        let reply = parse_analysis(raw).unwrap().value;
        assert_eq!(reply.steps.len(), 2);
        assert_eq!(reply.steps[0].rect.x, 12.0);
        assert_eq!(reply.steps[1].id, "7");
        assert_eq!(reply.steps[1].label, "c");
    }

    #[test]
    fn plus_sign_and_raw_newline_are_repaired() {
        let raw = "{\"accuracy_score\": +0.9, \"feedback\": \"ok\n\"}";
        let parsed = parse_calibration(raw).unwrap();
        assert_eq!(parsed.recovery, RecoveryPath::Repaired);
        assert_eq!(parsed.value.accuracy_score, 0.9);
        assert_eq!(parsed.value.feedback, "ok\n");
        assert_eq!(parsed.value.corrected_rect, None);
        assert_eq!(
            repair(raw).unwrap(),
            "{\"accuracy_score\": 0.9, \"feedback\": \"ok\\n\"}"
        );
    }

    #[test]
    fn parse_is_idempotent_over_repaired_text() {
        let raw = "noise {\"accuracy_score\": +0.75, \"position_offset\": {\"x\": +4, \"y\": -2},\n\"feedback\": \"move\tleft\r\nslightly\"} tail";
        let first = parse(raw).unwrap().value;
        let normalized = repair(raw).unwrap();
        let second = parse(&normalized).unwrap().value;
        assert_eq!(first, second);
        assert_eq!(repair(&normalized).unwrap(), normalized);
    }

    #[test]
    fn plus_inside_strings_is_left_alone() {
        let raw = r#"{"accuracy_score": +1, "feedback": "rated: +5 stars"}"#;
        let result = parse_calibration(raw).unwrap().value;
        assert_eq!(result.feedback, "rated: +5 stars");
        assert_eq!(result.accuracy_score, 1.0);
    }

    #[test]
    fn truncated_calibration_falls_back_to_extraction() {
        let raw = r#"{"accuracy_score": 0.42, "position_offset": {"x": 12, "y": -3}, "size_correction": {"width": +8, "height": 0}, "feedback": "shift \"left\"", "corrected_position": {"x": 1"#;
        let parsed = parse_calibration(raw).unwrap();
        assert_eq!(parsed.recovery, RecoveryPath::Extracted);
        let result = parsed.value;
        assert_eq!(result.accuracy_score, 0.42);
        assert_eq!(result.position_offset, PositionOffset { x: 12.0, y: -3.0 });
        assert_eq!(result.size_correction, SizeCorrection { width: 8.0, height: 0.0 });
        assert_eq!(result.feedback, "shift \"left\"");
        assert_eq!(result.corrected_rect, None);
    }

    #[test]
    fn corrected_position_is_kept_as_logical() {
        let raw = r#"{"accuracy_score": 0.5, "feedback": "", "corrected_position": {"x": 5, "y": 6, "width": 70, "height": 40}}"#;
        let result = parse_calibration(raw).unwrap().value;
        assert_eq!(result.corrected_rect, Some(ScreenRect::logical(5.0, 6.0, 70.0, 40.0)));
    }

    #[test]
    fn out_of_range_score_is_clamped() {
        let result = parse_calibration(r#"{"accuracy_score": 3.5}"#).unwrap().value;
        assert_eq!(result.accuracy_score, 1.0);
        assert_eq!(result.feedback, "");
    }

    #[test]
    fn prose_only_is_unrecoverable_with_excerpt() {
        let raw = format!("I could not find that element. {}", "z".repeat(900));
        let err = parse(&raw).unwrap_err();
        assert!(err.excerpt().starts_with("I could not find"));
        assert_eq!(err.excerpt().chars().count(), 500);
    }

    #[test]
    fn object_without_mandatory_fields_is_unrecoverable() {
        assert!(parse_analysis(r#"{"foo": 1}"#).is_err());
        assert!(parse_calibration(r#"{"feedback": "great"}"#).is_err());
    }

    #[test]
    fn generic_parse_detects_kind() {
        let analysis = parse(r#"{"message": "none found", "steps": []}"#).unwrap().value;
        assert!(matches!(analysis, ParsedResponse::Analysis(reply) if reply.steps.is_empty()));
        let calibration = parse(r#"{"accuracy_score": 0.2}"#).unwrap().value;
        assert!(matches!(calibration, ParsedResponse::Calibration(c) if c.accuracy_score == 0.2));
    }
}
