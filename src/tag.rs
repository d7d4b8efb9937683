// ABOUTME: Tag expression -> HTML evaluation (spec.md §4.3 "Tag evaluation")

use crate::ast::{TagAttr, TagChild, TagExpr};
use crate::error::RuntimeError;
use crate::eval::Evaluator;
use crate::value::Value;

/// Attributes whose value is trusted raw markup rather than escaped text
/// (spec.md §4.3: "known-safe (`style`, `script`)").
fn is_known_safe_attr(name: &str) -> bool {
    matches!(name, "style" | "script")
}

const VOID_ELEMENTS: &[&str] = &["input", "br", "img", "meta", "link", "hr"];

pub fn eval_tag(evaluator: &mut Evaluator, tag: &TagExpr) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    out.push('<');
    out.push_str(&tag.name);

    for attr in &tag.attrs {
        render_attr(evaluator, attr, &mut out)?;
    }

    let is_void = VOID_ELEMENTS.contains(&tag.name.as_str());
    if tag.self_closing || is_void {
        out.push_str(" />");
        return Ok(Value::Tag(out.into()));
    }
    out.push('>');

    for child in &tag.children {
        render_child(evaluator, child, &mut out)?;
    }

    out.push_str("</");
    out.push_str(&tag.name);
    out.push('>');
    Ok(Value::Tag(out.into()))
}

fn render_attr(evaluator: &mut Evaluator, attr: &TagAttr, out: &mut String) -> Result<(), RuntimeError> {
    let value = match &attr.value {
        Some(expr) => evaluator.eval(expr)?,
        None => Value::Boolean(true),
    };
    // Boolean-false or null attribute values are omitted entirely.
    if matches!(value, Value::Boolean(false) | Value::Null) {
        return Ok(());
    }
    out.push(' ');
    out.push_str(&attr.name);
    if matches!(value, Value::Boolean(true)) && attr.value.is_none() {
        return Ok(());
    }
    out.push_str("=\"");
    if is_known_safe_attr(&attr.name) {
        out.push_str(&value.to_string());
    } else {
        out.push_str(&escape_html(&value.to_string()));
    }
    out.push('"');
    Ok(())
}

fn render_child(evaluator: &mut Evaluator, child: &TagChild, out: &mut String) -> Result<(), RuntimeError> {
    match child {
        TagChild::Text(text) => out.push_str(text),
        TagChild::Tag(nested) => {
            if let Value::Tag(html) = eval_tag(evaluator, nested)? {
                out.push_str(&html);
            }
        }
        TagChild::Interp(expr) => {
            let value = evaluator.eval(expr)?;
            match value {
                // Already-escaped tag output passes through unescaped.
                Value::Tag(html) => out.push_str(&html),
                other => out.push_str(&escape_html(&other.to_string())),
            }
        }
    }
    Ok(())
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_special_characters() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn void_elements_are_recognized() {
        assert!(VOID_ELEMENTS.contains(&"br"));
        assert!(!VOID_ELEMENTS.contains(&"div"));
    }
}
