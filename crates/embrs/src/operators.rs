//! Binary operator semantics.
//!
//! The VM delegates every arithmetic, bitwise, and ordering opcode here.
//! `+` is overloaded across numbers, strings (with number-to-string
//! coercion of one operand), lists, and byte sequences; `*` repeats
//! strings and lists. Bitwise opcodes coerce through 32-bit integers with
//! truncation toward zero and defined wraparound. Booleans participate in
//! numeric contexts as 0 and 1.
//!
//! Errors are returned as plain messages; the VM turns them into raised
//! `Exception` instances.

use crate::bytecode::Opcode;
use crate::heap::{Heap, Obj};
use crate::value::{format_number, type_name, Value};

type OpResult = std::result::Result<Value, String>;

/// Apply a binary opcode to two operands.
pub fn binary_op(heap: &mut Heap, op: Opcode, left: Value, right: Value) -> OpResult {
    match op {
        Opcode::Add => add(heap, left, right),
        Opcode::Multiply => multiply(heap, left, right),
        Opcode::Subtract => numeric(heap, op, left, right, |a, b| a - b),
        Opcode::Divide => numeric(heap, op, left, right, |a, b| a / b),
        Opcode::FloorDivide => numeric(heap, op, left, right, |a, b| (a / b).floor()),
        // Floored-sign modulo; modulo by zero is NaN.
        Opcode::Remainder => numeric(heap, op, left, right, |a, b| a - b * (a / b).floor()),
        Opcode::Pow => numeric(heap, op, left, right, f64::powf),
        Opcode::BitAnd => integer(heap, op, left, right, |a, b| a & b),
        Opcode::BitOr => integer(heap, op, left, right, |a, b| a | b),
        Opcode::BitXor => integer(heap, op, left, right, |a, b| a ^ b),
        Opcode::LeftShift => integer(heap, op, left, right, |a, b| a.wrapping_shl(b as u32 & 0x1f)),
        Opcode::RightShift => integer(heap, op, left, right, |a, b| a.wrapping_shr(b as u32 & 0x1f)),
        Opcode::Greater => ordering(heap, op, left, right, |a, b| a > b),
        Opcode::Less => ordering(heap, op, left, right, |a, b| a < b),
        _ => unreachable!("not a binary opcode: {:?}", op),
    }
}

fn add(heap: &mut Heap, left: Value, right: Value) -> OpResult {
    // String concatenation wins whenever either side is a string. A nil
    // operand is absorbed: the string side passes through unchanged.
    if is_string(heap, left) || is_string(heap, right) {
        if left.is_nil() {
            return Ok(right);
        }
        if right.is_nil() {
            return Ok(left);
        }
        let lhs = coerce_for_concat(heap, left)
            .ok_or_else(|| type_error(heap, "+", left, right))?;
        let rhs = coerce_for_concat(heap, right)
            .ok_or_else(|| type_error(heap, "+", left, right))?;
        let joined = format!("{}{}", lhs, rhs);
        return Ok(heap.intern_value(&joined));
    }

    if let (Value::Obj(a), Value::Obj(b)) = (left, right) {
        if let (Obj::List(x), Obj::List(y)) = (heap.get(a), heap.get(b)) {
            let mut items = x.items.clone();
            items.extend_from_slice(&y.items);
            return Ok(heap.alloc_list(items));
        }
        if let (Obj::Bytes(x), Obj::Bytes(y)) = (heap.get(a), heap.get(b)) {
            let mut bytes = x.bytes.clone();
            bytes.extend_from_slice(&y.bytes);
            return Ok(heap.alloc_bytes(bytes));
        }
    }

    numeric(heap, Opcode::Add, left, right, |a, b| a + b)
}

fn multiply(heap: &mut Heap, left: Value, right: Value) -> OpResult {
    // string * n and list * n repeat; the number may be on either side.
    let repeat = |n: f64| if n <= 0.0 { 0 } else { n.trunc() as usize };
    match (left, right) {
        (Value::Obj(r), Value::Number(n)) | (Value::Number(n), Value::Obj(r)) => {
            match heap.get(r) {
                Obj::Str(s) => {
                    let repeated = s.text.repeat(repeat(n));
                    return Ok(heap.intern_value(&repeated));
                }
                Obj::List(l) => {
                    let mut items = Vec::with_capacity(l.items.len() * repeat(n));
                    for _ in 0..repeat(n) {
                        items.extend_from_slice(&heap.list(r).items);
                    }
                    return Ok(heap.alloc_list(items));
                }
                _ => {}
            }
            numeric(heap, Opcode::Multiply, left, right, |a, b| a * b)
        }
        _ => numeric(heap, Opcode::Multiply, left, right, |a, b| a * b),
    }
}

/// Numeric-context coercion: booleans count as 0/1.
fn as_number(value: Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(n),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        _ => None,
    }
}

/// Coerce to 32-bit integer context: truncation toward zero, wrapping.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64) as i32
}

fn numeric(
    heap: &Heap,
    op: Opcode,
    left: Value,
    right: Value,
    f: impl Fn(f64, f64) -> f64,
) -> OpResult {
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(type_error(heap, op_symbol(op), left, right));
    };
    Ok(Value::Number(f(a, b)))
}

fn integer(
    heap: &Heap,
    op: Opcode,
    left: Value,
    right: Value,
    f: impl Fn(i32, i32) -> i32,
) -> OpResult {
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(type_error(heap, op_symbol(op), left, right));
    };
    Ok(Value::Number(f(to_int32(a), to_int32(b)) as f64))
}

fn ordering(
    heap: &Heap,
    op: Opcode,
    left: Value,
    right: Value,
    f: impl Fn(f64, f64) -> bool,
) -> OpResult {
    if let (Value::Obj(a), Value::Obj(b)) = (left, right) {
        if let (Obj::Str(x), Obj::Str(y)) = (heap.get(a), heap.get(b)) {
            let ordered = match op {
                Opcode::Greater => x.text > y.text,
                _ => x.text < y.text,
            };
            return Ok(Value::Bool(ordered));
        }
    }
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(type_error(heap, op_symbol(op), left, right));
    };
    Ok(Value::Bool(f(a, b)))
}

fn is_string(heap: &Heap, value: Value) -> bool {
    match value {
        Value::Obj(r) => matches!(heap.get(r), Obj::Str(_)),
        _ => false,
    }
}

/// What a value contributes to string concatenation: strings as-is,
/// numbers via their printed form. Everything else — booleans included —
/// refuses rather than silently stringify.
fn coerce_for_concat(heap: &Heap, value: Value) -> Option<String> {
    match value {
        Value::Obj(r) => match heap.get(r) {
            Obj::Str(s) => Some(s.text.to_string()),
            _ => None,
        },
        Value::Number(n) => Some(format_number(n)),
        _ => None,
    }
}

fn op_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "+",
        Opcode::Subtract => "-",
        Opcode::Multiply => "*",
        Opcode::Divide => "/",
        Opcode::FloorDivide => "//",
        Opcode::Remainder => "%",
        Opcode::Pow => "**",
        Opcode::BitAnd => "&",
        Opcode::BitOr => "|",
        Opcode::BitXor => "^",
        Opcode::LeftShift => "<<",
        Opcode::RightShift => ">>",
        Opcode::Greater => ">",
        Opcode::Less => "<",
        _ => "?",
    }
}

fn type_error(heap: &Heap, symbol: &str, left: Value, right: Value) -> String {
    format!(
        "unsupported operand {} for {} and {}",
        symbol,
        type_name(heap, left),
        type_name(heap, right)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::stringify;

    #[test]
    fn string_number_concat() {
        let mut heap = Heap::new();
        let s = heap.intern_value("v");
        let out = binary_op(&mut heap, Opcode::Add, s, Value::Number(2.0)).unwrap();
        assert_eq!(stringify(&heap, out), "v2");
    }

    #[test]
    fn nil_is_absorbed_by_string_concat() {
        let mut heap = Heap::new();
        let s = heap.intern_value("x");
        let out = binary_op(&mut heap, Opcode::Add, s, Value::Nil).unwrap();
        assert_eq!(out, s);
        let out = binary_op(&mut heap, Opcode::Add, Value::Nil, s).unwrap();
        assert_eq!(out, s);
    }

    #[test]
    fn booleans_do_not_concatenate() {
        let mut heap = Heap::new();
        let s = heap.intern_value("x");
        let err = binary_op(&mut heap, Opcode::Add, s, Value::Bool(true)).unwrap_err();
        assert!(err.contains("unsupported operand +"));
        assert!(binary_op(&mut heap, Opcode::Add, Value::Bool(false), s).is_err());
    }

    #[test]
    fn list_concat_builds_new_list() {
        let mut heap = Heap::new();
        let a = heap.alloc_list(vec![Value::Number(1.0)]);
        let b = heap.alloc_list(vec![Value::Number(2.0)]);
        let out = binary_op(&mut heap, Opcode::Add, a, b).unwrap();
        let out_ref = out.as_obj().unwrap();
        assert_eq!(heap.list(out_ref).items.len(), 2);
        // Operands are untouched.
        assert_eq!(heap.list(a.as_obj().unwrap()).items.len(), 1);
    }

    #[test]
    fn string_repetition() {
        let mut heap = Heap::new();
        let s = heap.intern_value("ab");
        let out = binary_op(&mut heap, Opcode::Multiply, s, Value::Number(3.0)).unwrap();
        assert_eq!(stringify(&heap, out), "ababab");
    }

    #[test]
    fn division_by_zero_is_infinite() {
        let mut heap = Heap::new();
        let out =
            binary_op(&mut heap, Opcode::Divide, Value::Number(1.0), Value::Number(0.0)).unwrap();
        assert_eq!(out.as_number(), Some(f64::INFINITY));
    }

    #[test]
    fn modulo_by_zero_is_nan() {
        let mut heap = Heap::new();
        let out =
            binary_op(&mut heap, Opcode::Remainder, Value::Number(5.0), Value::Number(0.0)).unwrap();
        assert!(out.as_number().unwrap().is_nan());
    }

    #[test]
    fn remainder_sign_follows_divisor() {
        let mut heap = Heap::new();
        let out =
            binary_op(&mut heap, Opcode::Remainder, Value::Number(-7.0), Value::Number(3.0)).unwrap();
        assert_eq!(out.as_number(), Some(2.0));
    }

    #[test]
    fn int32_coercion_wraps() {
        assert_eq!(to_int32(1.9), 1);
        assert_eq!(to_int32(-1.9), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(4294967296.0 + 5.0), 5);
    }

    #[test]
    fn bitwise_ops_use_int32_context() {
        let mut heap = Heap::new();
        let out =
            binary_op(&mut heap, Opcode::BitOr, Value::Number(6.5), Value::Number(1.0)).unwrap();
        assert_eq!(out.as_number(), Some(7.0));
    }

    #[test]
    fn mixed_operand_type_errors() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        assert!(binary_op(&mut heap, Opcode::Subtract, list, Value::Number(1.0)).is_err());
    }
}
