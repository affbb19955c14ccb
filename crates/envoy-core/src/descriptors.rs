//! Declarative value extraction.
//!
//! Variant tables describe each property as either a JSONPath-style
//! expression over a decoded JSON payload or a regex over an HTML page.
//! Only the small expression subset those tables use is implemented:
//! dotted keys, quoted keys, and `[?(...)]` array filters with `==`,
//! `>` and existence clauses joined by `&`.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Gt,
}

#[derive(Debug, Clone)]
struct FilterClause {
    key: String,
    cmp: Option<(CmpOp, Literal)>,
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Filter(Vec<FilterClause>),
}

fn parse_literal(raw: &str) -> Option<Literal> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        return Some(Literal::Str(inner.to_string()));
    }
    raw.parse::<f64>().ok().map(Literal::Num)
}

fn parse_clause(raw: &str) -> Option<FilterClause> {
    let raw = raw.trim();
    let rest = raw.strip_prefix("@.")?;

    if let Some(idx) = rest.find("==") {
        let key = rest[..idx].trim().to_string();
        let literal = parse_literal(&rest[idx + 2..])?;
        return Some(FilterClause {
            key,
            cmp: Some((CmpOp::Eq, literal)),
        });
    }
    if let Some(idx) = rest.find('>') {
        let key = rest[..idx].trim().to_string();
        let literal = parse_literal(&rest[idx + 1..])?;
        return Some(FilterClause {
            key,
            cmp: Some((CmpOp::Gt, literal)),
        });
    }

    Some(FilterClause {
        key: rest.trim().to_string(),
        cmp: None,
    })
}

fn parse_segment(raw: &str, out: &mut Vec<Segment>) -> bool {
    if raw.is_empty() {
        return true;
    }
    if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        out.push(Segment::Key(inner.to_string()));
        return true;
    }

    match raw.find("[?(") {
        None => {
            out.push(Segment::Key(raw.to_string()));
            true
        }
        Some(idx) => {
            if idx > 0 {
                out.push(Segment::Key(raw[..idx].to_string()));
            }
            let Some(inner) = raw[idx + 3..].strip_suffix(")]") else {
                return false;
            };
            let mut clauses = Vec::new();
            for part in inner.split('&') {
                match parse_clause(part) {
                    Some(clause) => clauses.push(clause),
                    None => return false,
                }
            }
            out.push(Segment::Filter(clauses));
            true
        }
    }
}

fn parse_expression(expr: &str) -> Option<Vec<Segment>> {
    let expr = expr.strip_prefix('$').unwrap_or(expr);
    let expr = expr.strip_prefix('.').unwrap_or(expr);

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;

    for ch in expr.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '[' if !in_quote => {
                depth += 1;
                current.push(ch);
            }
            ']' if !in_quote => {
                depth = depth.checked_sub(1)?;
                current.push(ch);
            }
            '.' if !in_quote && depth == 0 => {
                if !parse_segment(&current, &mut segments) {
                    return None;
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if in_quote || depth != 0 || !parse_segment(&current, &mut segments) {
        return None;
    }

    Some(segments)
}

fn clause_matches(clause: &FilterClause, element: &Value) -> bool {
    let field = match element.get(&clause.key) {
        Some(v) => v,
        None => return false,
    };

    match &clause.cmp {
        None => !field.is_null(),
        Some((CmpOp::Eq, Literal::Str(s))) => field.as_str() == Some(s.as_str()),
        Some((CmpOp::Eq, Literal::Num(n))) => field.as_f64() == Some(*n),
        Some((CmpOp::Gt, Literal::Num(n))) => field.as_f64().map(|v| v > *n).unwrap_or(false),
        Some((CmpOp::Gt, Literal::Str(_))) => false,
    }
}

/// Evaluate a path expression against a JSON document.
///
/// The empty expression selects the whole document. No match yields
/// `None`; a single match is unwrapped; multiple matches come back as
/// an array.
pub fn resolve_json_path(expr: &str, doc: &Value) -> Option<Value> {
    if expr.is_empty() {
        return Some(doc.clone());
    }

    let segments = match parse_expression(expr) {
        Some(segments) => segments,
        None => {
            debug!(expr, "unparseable path expression");
            return None;
        }
    };

    let mut nodes = vec![doc.clone()];
    for segment in &segments {
        let mut next = Vec::new();
        match segment {
            Segment::Key(key) => {
                for node in &nodes {
                    if let Some(child) = node.get(key) {
                        next.push(child.clone());
                    }
                }
            }
            Segment::Filter(clauses) => {
                for node in &nodes {
                    if let Some(items) = node.as_array() {
                        for item in items {
                            if clauses.iter().all(|c| clause_matches(c, item)) {
                                next.push(item.clone());
                            }
                        }
                    }
                }
            }
        }
        nodes = next;
        if nodes.is_empty() {
            return None;
        }
    }

    match nodes.len() {
        1 => nodes.pop(),
        _ => Some(Value::Array(nodes)),
    }
}

/// Run a two-group regex (value, unit) over page text and normalize the
/// unit to base watts / watt-hours.
pub fn resolve_regex(pattern: &str, text: &str) -> Option<f64> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => {
            debug!(pattern, %err, "invalid extraction pattern");
            return None;
        }
    };

    let caps = match re.captures(text) {
        Some(caps) => caps,
        None => {
            debug!(pattern, "extraction pattern found no match");
            return None;
        }
    };
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    let scaled = match unit {
        "kW" | "kWh" => value * 1_000.0,
        "MW" | "MWh" => value * 1_000_000.0,
        _ => value,
    };
    Some(scaled)
}
