//! Per-loop-frame iteration state: array walks, numeric ranges, and string
//! ranges driven by magic increment.

use crate::Value;

#[derive(Debug)]
pub(crate) enum IterState {
    Items {
        items: Vec<Value>,
        ix: usize,
        reversed: bool,
    },
    NumRange {
        cur: i64,
        max: i64,
    },
    StrRange {
        cur: Option<String>,
        max: String,
    },
}

impl IterState {
    pub(crate) fn over_items(items: Vec<Value>, reversed: bool) -> Self {
        let ix = if reversed { items.len() } else { 0 };
        IterState::Items {
            items,
            ix,
            reversed,
        }
    }

    /// Builds range iteration state from the two popped bounds. Numeric
    /// stepping applies when either bound looks numeric; otherwise the low
    /// bound is magically incremented toward the high bound.
    pub(crate) fn over_range(lo: &Value, hi: &Value) -> Result<Self, String> {
        if range_is_numeric(lo, hi) {
            let (lo_n, hi_n) = (lo.as_num(), hi.as_num());
            if lo_n < i64::MIN as f64 || hi_n >= i64::MAX as f64 {
                return Err("Range iterator outside integer range".to_string());
            }
            Ok(IterState::NumRange {
                cur: lo.as_int(),
                max: hi.as_int(),
            })
        } else {
            Ok(IterState::StrRange {
                cur: Some(lo.to_string()),
                max: hi.to_string(),
            })
        }
    }

    pub(crate) fn next(&mut self) -> Option<Value> {
        match self {
            IterState::Items {
                items,
                ix,
                reversed,
            } => {
                if *reversed {
                    if *ix == 0 {
                        return None;
                    }
                    *ix -= 1;
                    Some(items[*ix].clone())
                } else {
                    if *ix >= items.len() {
                        return None;
                    }
                    let v = items[*ix].clone();
                    *ix += 1;
                    Some(v)
                }
            }
            IterState::NumRange { cur, max } => {
                if *cur > *max {
                    return None;
                }
                let v = Value::Int(*cur);
                *cur += 1;
                Some(v)
            }
            IterState::StrRange { cur, max } => {
                let c = cur.take()?;
                if c != *max {
                    let n = magic_increment(&c);
                    // The sequence ends when the next value would outgrow
                    // the high bound without ever matching it.
                    if n.len() <= max.len() {
                        *cur = Some(n);
                    }
                }
                Some(Value::Str(c))
            }
        }
    }
}

/// Whether a range bound selects numeric stepping: a numeric flag, or text
/// that looks like a number without a leading zero (the lone string `"0"`
/// still counts as numeric).
fn bound_is_numeric(v: &Value) -> bool {
    match v {
        Value::Undef | Value::Int(_) | Value::Num(_) => true,
        Value::Code(_) => true,
        Value::Str(s) => looks_like_number(s) && (s == "0" || !s.starts_with('0')),
    }
}

pub(crate) fn range_is_numeric(lo: &Value, hi: &Value) -> bool {
    bound_is_numeric(lo) || bound_is_numeric(hi)
}

fn looks_like_number(s: &str) -> bool {
    let t = s.trim();
    !t.is_empty() && t.parse::<f64>().is_ok()
}

/// Alphanumeric carry increment: the rightmost alphanumeric character steps
/// with carry (`"az"` becomes `"ba"`, `"zz"` becomes `"aaa"`, `"a9"`
/// becomes `"b0"`).
pub(crate) fn magic_increment(s: &str) -> String {
    if s.is_empty() {
        return "1".to_string();
    }
    let mut b = s.as_bytes().to_vec();
    let mut i = b.len() - 1;
    if !b[i].is_ascii_alphanumeric() {
        // Not a magical string; fall back to numeric increment.
        return Value::Int(Value::Str(s.to_string()).as_int() + 1).to_string();
    }
    loop {
        match b[i] {
            b'a'..=b'y' | b'A'..=b'Y' | b'0'..=b'8' => {
                b[i] += 1;
                break;
            }
            b'z' => b[i] = b'a',
            b'Z' => b[i] = b'A',
            b'9' => b[i] = b'0',
            _ => {
                // Carry ran into a non-alphanumeric prefix.
                let c = prepend_for(b[i + 1]);
                b.insert(i + 1, c);
                break;
            }
        }
        if i == 0 {
            let c = prepend_for(b[0]);
            b.insert(0, c);
            break;
        }
        i -= 1;
    }
    String::from_utf8(b).expect("ascii increment preserves utf8")
}

fn prepend_for(reset: u8) -> u8 {
    match reset {
        b'a'..=b'z' => b'a',
        b'A'..=b'Z' => b'A',
        _ => b'1',
    }
}
