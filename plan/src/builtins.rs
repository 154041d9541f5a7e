//! Pure (non-suspending) builtins: `chunk`, `range`, `flatten`, and the
//! intrinsic string/number methods. Anything that can call back into plan
//! code (array callbacks, `groupBy` with a function key, `map`) lives in
//! the interpreter, which can await.

use crate::value::Value;
use crate::value::format_number;

/// Default `chunk` size in characters, roughly 20k tokens of prose.
pub const DEFAULT_CHUNK_SIZE: usize = 80_000;

/// Split `text` into pieces no larger than `size` characters, preferring
/// newline boundaries so chunks stay line-aligned when possible.
pub fn chunk(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > size {
            // A single oversized line is hard-split.
            let mut piece = String::new();
            let mut piece_len = 0usize;
            for c in line.chars() {
                piece.push(c);
                piece_len += 1;
                if piece_len == size {
                    chunks.push(std::mem::take(&mut piece));
                    piece_len = 0;
                }
            }
            if !piece.is_empty() {
                current = piece;
                current_len = piece_len;
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Half-open integer sequence `[start, end)`. A single argument means
/// `range(0, end)`.
pub fn range(start: f64, end: Option<f64>) -> Vec<Value> {
    let (start, end) = match end {
        Some(end) => (start, end),
        None => (0.0, start),
    };
    let start = start.trunc() as i64;
    let end = end.trunc() as i64;
    if end <= start {
        return Vec::new();
    }
    (start..end).map(|n| Value::Number(n as f64)).collect()
}

/// Recursively flatten nested arrays into one array.
pub fn flatten(value: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            let items = match items.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => Vec::new(),
            };
            for item in items {
                flatten_into(&item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Flatten exactly `depth` levels (the `Array.prototype.flat` shape).
pub fn flatten_depth(value: &Value, depth: usize) -> Vec<Value> {
    let Value::Array(items) = value else {
        return vec![value.clone()];
    };
    let items = match items.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => Vec::new(),
    };
    let mut out = Vec::new();
    for item in items {
        if depth > 0 && matches!(item, Value::Array(_)) {
            out.extend(flatten_depth(&item, depth - 1));
        } else {
            out.push(item);
        }
    }
    out
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn str_arg(args: &[Value], index: usize) -> String {
    match args.get(index) {
        Some(Value::Undefined) | None => String::new(),
        Some(v) => v.to_display(),
    }
}

fn index_arg(args: &[Value], index: usize, len: usize, default: usize) -> usize {
    match args.get(index) {
        Some(Value::Undefined) | None => default,
        Some(v) => clamp_index(v.to_number(), len),
    }
}

/// Negative indices count from the end, as slice-style methods expect.
fn clamp_index(n: f64, len: usize) -> usize {
    if n.is_nan() {
        return 0;
    }
    let n = n.trunc() as i64;
    if n < 0 {
        len.saturating_sub(n.unsigned_abs() as usize)
    } else {
        (n as usize).min(len)
    }
}

/// Intrinsic methods on string receivers. `Err` is thrown into plan code.
pub fn string_method(receiver: &str, name: &str, args: &[Value]) -> Result<Value, String> {
    let chars: Vec<char> = receiver.chars().collect();
    let len = chars.len();
    let value = match name {
        "split" => {
            let parts: Vec<Value> = match args.first() {
                Some(Value::Str(sep)) if !sep.is_empty() => {
                    receiver.split(sep.as_str()).map(Value::str).collect()
                }
                Some(Value::Str(_)) => chars.iter().map(|c| Value::str(c.to_string())).collect(),
                _ => vec![Value::str(receiver)],
            };
            Value::array(parts)
        }
        "trim" => Value::str(receiver.trim()),
        "trimStart" => Value::str(receiver.trim_start()),
        "trimEnd" => Value::str(receiver.trim_end()),
        "toUpperCase" => Value::str(receiver.to_uppercase()),
        "toLowerCase" => Value::str(receiver.to_lowercase()),
        "includes" => Value::Bool(receiver.contains(&str_arg(args, 0))),
        "startsWith" => Value::Bool(receiver.starts_with(&str_arg(args, 0))),
        "endsWith" => Value::Bool(receiver.ends_with(&str_arg(args, 0))),
        "indexOf" => {
            let needle = str_arg(args, 0);
            match receiver.find(&needle) {
                Some(byte_index) => {
                    let char_index = receiver[..byte_index].chars().count();
                    Value::Number(char_index as f64)
                }
                None => Value::Number(-1.0),
            }
        }
        "slice" | "substring" => {
            let start = index_arg(args, 0, len, 0);
            let end = index_arg(args, 1, len, len);
            let (start, end) = if name == "substring" && start > end {
                (end, start)
            } else {
                (start, end.max(start))
            };
            Value::str(chars[start..end].iter().collect::<String>())
        }
        "charAt" => {
            let i = index_arg(args, 0, len, 0);
            Value::str(chars.get(i).map(|c| c.to_string()).unwrap_or_default())
        }
        "repeat" => {
            let count = arg(args, 0).to_number();
            if !(0.0..=100_000.0).contains(&count) {
                return Err("Invalid repeat count".to_string());
            }
            Value::str(receiver.repeat(count.trunc() as usize))
        }
        "padStart" | "padEnd" => {
            let target = arg(args, 0).to_number().max(0.0).trunc() as usize;
            let pad = match args.get(1) {
                Some(Value::Str(s)) if !s.is_empty() => s.clone(),
                _ => " ".to_string(),
            };
            let mut out = receiver.to_string();
            let pad_chars: Vec<char> = pad.chars().collect();
            let mut i = 0;
            let mut prefix = String::new();
            while receiver.chars().count() + prefix.chars().count() < target {
                prefix.push(pad_chars[i % pad_chars.len()]);
                i += 1;
            }
            if name == "padStart" {
                out = format!("{prefix}{out}");
            } else {
                out.push_str(&prefix);
            }
            Value::str(out)
        }
        "replace" => {
            let from = str_arg(args, 0);
            let to = str_arg(args, 1);
            Value::str(receiver.replacen(&from, &to, 1))
        }
        "replaceAll" => {
            let from = str_arg(args, 0);
            let to = str_arg(args, 1);
            if from.is_empty() {
                Value::str(receiver)
            } else {
                Value::str(receiver.replace(&from, &to))
            }
        }
        "concat" => {
            let mut out = receiver.to_string();
            for a in args {
                out.push_str(&a.to_display());
            }
            Value::str(out)
        }
        "toString" => Value::str(receiver),
        _ => return Err(format!("String has no method '{name}'")),
    };
    Ok(value)
}

/// Intrinsic methods on number receivers.
pub fn number_method(receiver: f64, name: &str, args: &[Value]) -> Result<Value, String> {
    let value = match name {
        "toFixed" => {
            let digits = arg(args, 0).to_number().clamp(0.0, 20.0).trunc() as usize;
            Value::str(format!("{receiver:.digits$}"))
        }
        "toString" => Value::str(format_number(receiver)),
        _ => return Err(format!("Number has no method '{name}'")),
    };
    Ok(value)
}

pub fn math_fn(name: &str, args: &[Value]) -> Result<Value, String> {
    let first = arg(args, 0).to_number();
    let value = match name {
        "floor" => Value::Number(first.floor()),
        "ceil" => Value::Number(first.ceil()),
        "round" => Value::Number(first.round()),
        "trunc" => Value::Number(first.trunc()),
        "abs" => Value::Number(first.abs()),
        "sqrt" => Value::Number(first.sqrt()),
        "sign" => Value::Number(if first == 0.0 { 0.0 } else { first.signum() }),
        "pow" => Value::Number(first.powf(arg(args, 1).to_number())),
        "min" => Value::Number(
            args.iter()
                .map(Value::to_number)
                .fold(f64::INFINITY, f64::min),
        ),
        "max" => Value::Number(
            args.iter()
                .map(Value::to_number)
                .fold(f64::NEG_INFINITY, f64::max),
        ),
        _ => return Err(format!("Math has no method '{name}'")),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn chunk_respects_size_and_covers_input() {
        let text = "line one\nline two\nline three\n";
        let chunks = chunk(text, 12);
        assert!(chunks.iter().all(|c| c.chars().count() <= 12));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_hard_splits_oversized_lines() {
        let text = "abcdefghij";
        let chunks = chunk(text, 3);
        assert_eq!(chunks, vec!["abc", "def", "ghi", "j"]);
    }

    #[test]
    fn chunk_of_empty_text_is_one_empty_chunk() {
        assert_eq!(chunk("", 10), vec![String::new()]);
    }

    #[test]
    fn range_is_half_open() {
        let values: Vec<f64> = range(2.0, Some(5.0)).iter().map(Value::to_number).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(range(5.0, Some(2.0)).is_empty());
        let single: Vec<f64> = range(3.0, None).iter().map(Value::to_number).collect();
        assert_eq!(single, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn flatten_is_recursive() {
        let nested = Value::array(vec![
            Value::Number(1.0),
            Value::array(vec![Value::Number(2.0), Value::array(vec![Value::Number(3.0)])]),
        ]);
        let flat: Vec<f64> = flatten(&nested).iter().map(Value::to_number).collect();
        assert_eq!(flat, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn string_slice_and_negative_indices() {
        let v = string_method("hello world", "slice", &[Value::Number(-5.0)]).unwrap();
        assert_eq!(v.to_display(), "world");
        let v = string_method("hello", "slice", &[Value::Number(1.0), Value::Number(3.0)]).unwrap();
        assert_eq!(v.to_display(), "el");
    }

    #[test]
    fn string_split_and_join_shapes() {
        let v = string_method("a,b,c", "split", &[Value::str(",")]).unwrap();
        match v {
            Value::Array(items) => assert_eq!(items.lock().unwrap().len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_an_error() {
        assert!(string_method("x", "explode", &[]).is_err());
    }

    #[test]
    fn to_fixed_formats() {
        let v = number_method(3.14159, "toFixed", &[Value::Number(2.0)]).unwrap();
        assert_eq!(v.to_display(), "3.14");
    }
}
