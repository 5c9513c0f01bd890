//! Built-in methods on string, list, dictionary, bytes, range, and file
//! values.
//!
//! These are dispatched by the VM's `Invoke` opcode exactly like user
//! methods: the receiver sits under the arguments and the result replaces
//! both. The iteration pair `@itern`/`@iter` is provided here natively for
//! every built-in container so `foreach` works without user code.
//!
//! Errors are plain messages; the VM raises them as `Exception`s.

use crate::heap::{Heap, Obj, ObjRef};
use crate::table::Table;
use crate::value::{hash_value, stringify, Value};

type MethodResult = std::result::Result<Value, String>;

/// Dispatch a built-in method call. Returns `None` when the receiver is
/// not a built-in container (instances, classes, and modules have their
/// own lookup paths in the VM).
pub fn dispatch(
    heap: &mut Heap,
    receiver: Value,
    name: &str,
    args: &[Value],
) -> Option<MethodResult> {
    let r = receiver.as_obj()?;
    match heap.get(r) {
        Obj::Str(_) => Some(string_method(heap, r, name, args)),
        Obj::List(_) => Some(list_method(heap, r, name, args)),
        Obj::Dict(_) => Some(dict_method(heap, r, name, args)),
        Obj::Bytes(_) => Some(bytes_method(heap, r, name, args)),
        Obj::Range(_) => Some(range_method(heap, r, name, args)),
        Obj::File(_) => Some(file_method(heap, r, name, args)),
        _ => None,
    }
}

// Method-name tables, one per receiver type, mirroring the dispatch arms
// below. Property access validates against these before it binds anything.
const STRING_METHODS: &[&str] = &[
    "length", "upper", "lower", "trim", "ltrim", "rtrim", "split", "index_of", "starts_with",
    "ends_with", "count", "replace", "to_list", "to_bytes", "to_number", "@itern", "@iter",
];
const LIST_METHODS: &[&str] = &[
    "length", "append", "clear", "clone", "count", "extend", "index_of", "insert", "pop",
    "shift", "reverse", "contains", "first", "last", "take", "get", "compact", "to_dict",
    "@itern", "@iter",
];
const DICT_METHODS: &[&str] = &[
    "length", "add", "set", "clear", "clone", "contains", "extend", "get", "keys", "values",
    "remove", "to_list", "@itern", "@iter",
];
const BYTES_METHODS: &[&str] = &[
    "length", "append", "clone", "extend", "first", "last", "get", "reverse", "to_list",
    "to_string", "@itern", "@iter",
];
const RANGE_METHODS: &[&str] = &["lower", "upper", "range", "to_list", "@itern", "@iter"];
const FILE_METHODS: &[&str] = &["path", "mode", "is_open", "close"];

/// Whether `name` is a method the receiver's built-in type defines.
/// Returns `None` when the receiver is not a built-in container.
pub fn has_method(heap: &Heap, receiver: Value, name: &str) -> Option<bool> {
    let r = receiver.as_obj()?;
    let table = match heap.get(r) {
        Obj::Str(_) => STRING_METHODS,
        Obj::List(_) => LIST_METHODS,
        Obj::Dict(_) => DICT_METHODS,
        Obj::Bytes(_) => BYTES_METHODS,
        Obj::Range(_) => RANGE_METHODS,
        Obj::File(_) => FILE_METHODS,
        _ => return None,
    };
    Some(table.contains(&name))
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{}() expects {} argument(s), {} given",
            name,
            expected,
            args.len()
        ));
    }
    Ok(())
}

fn expect_number(name: &str, value: Value) -> Result<f64, String> {
    value
        .as_number()
        .ok_or_else(|| format!("{}() expects a number argument", name))
}

fn expect_string(heap: &Heap, name: &str, value: Value) -> Result<String, String> {
    if let Some(r) = value.as_obj() {
        if let Obj::Str(s) = heap.get(r) {
            return Ok(s.text.to_string());
        }
    }
    Err(format!("{}() expects a string argument", name))
}

/// Advance a zero-based numeric cursor over `length` items, following the
/// iteration protocol: `nil` starts, a falsey result stops.
fn next_index(previous: Value, length: usize) -> MethodResult {
    match previous {
        Value::Nil => {
            if length == 0 {
                Ok(Value::Nil)
            } else {
                Ok(Value::Number(0.0))
            }
        }
        Value::Number(n) => {
            let next = n as i64 + 1;
            if (next as usize) < length {
                Ok(Value::Number(next as f64))
            } else {
                Ok(Value::Nil)
            }
        }
        _ => Err("this container is numerically indexed for iteration".to_string()),
    }
}

// ---------------------------------------------------------------------------
// string
// ---------------------------------------------------------------------------

/// Return the character at a code-point index. The ascii hint lets the
/// common case index bytes directly instead of walking UTF-8.
pub fn string_char_at(heap: &Heap, r: ObjRef, index: usize) -> Option<String> {
    let s = heap.string(r);
    if s.ascii {
        s.text.as_bytes().get(index).map(|b| (*b as char).to_string())
    } else {
        s.text.chars().nth(index).map(|c| c.to_string())
    }
}

fn string_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "length" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.string(r).chars as f64))
        }
        "upper" => {
            arity(name, args, 0)?;
            let text = heap.string(r).text.to_uppercase();
            Ok(heap.intern_value(&text))
        }
        "lower" => {
            arity(name, args, 0)?;
            let text = heap.string(r).text.to_lowercase();
            Ok(heap.intern_value(&text))
        }
        "trim" => {
            arity(name, args, 0)?;
            let text = heap.string(r).text.trim().to_string();
            Ok(heap.intern_value(&text))
        }
        "ltrim" => {
            arity(name, args, 0)?;
            let text = heap.string(r).text.trim_start().to_string();
            Ok(heap.intern_value(&text))
        }
        "rtrim" => {
            arity(name, args, 0)?;
            let text = heap.string(r).text.trim_end().to_string();
            Ok(heap.intern_value(&text))
        }
        "split" => {
            arity(name, args, 1)?;
            let sep = expect_string(heap, name, args[0])?;
            let text = heap.string(r).text.to_string();
            let parts: Vec<String> = if sep.is_empty() {
                text.chars().map(|c| c.to_string()).collect()
            } else {
                text.split(&sep).map(|p| p.to_string()).collect()
            };
            let items: Vec<Value> = parts.iter().map(|p| heap.intern_value(p)).collect();
            Ok(heap.alloc_list(items))
        }
        "index_of" => {
            arity(name, args, 1)?;
            let needle = expect_string(heap, name, args[0])?;
            let s = heap.string(r);
            match s.text.find(&needle) {
                // Report in code points so it agrees with indexing.
                Some(byte_pos) => Ok(Value::Number(s.text[..byte_pos].chars().count() as f64)),
                None => Ok(Value::Number(-1.0)),
            }
        }
        "starts_with" => {
            arity(name, args, 1)?;
            let prefix = expect_string(heap, name, args[0])?;
            Ok(Value::Bool(heap.string(r).text.starts_with(&prefix)))
        }
        "ends_with" => {
            arity(name, args, 1)?;
            let suffix = expect_string(heap, name, args[0])?;
            Ok(Value::Bool(heap.string(r).text.ends_with(&suffix)))
        }
        "count" => {
            arity(name, args, 1)?;
            let needle = expect_string(heap, name, args[0])?;
            if needle.is_empty() {
                return Ok(Value::Number(0.0));
            }
            Ok(Value::Number(heap.string(r).text.matches(&needle).count() as f64))
        }
        "replace" => {
            arity(name, args, 2)?;
            let old = expect_string(heap, name, args[0])?;
            let new = expect_string(heap, name, args[1])?;
            let text = heap.string(r).text.replace(&old, &new);
            Ok(heap.intern_value(&text))
        }
        "to_list" => {
            arity(name, args, 0)?;
            let chars: Vec<String> = heap.string(r).text.chars().map(|c| c.to_string()).collect();
            let items: Vec<Value> = chars.iter().map(|c| heap.intern_value(c)).collect();
            Ok(heap.alloc_list(items))
        }
        "to_bytes" => {
            arity(name, args, 0)?;
            let bytes = heap.string(r).text.as_bytes().to_vec();
            Ok(heap.alloc_bytes(bytes))
        }
        "to_number" => {
            arity(name, args, 0)?;
            let parsed = heap.string(r).text.trim().parse::<f64>().unwrap_or(0.0);
            Ok(Value::Number(parsed))
        }
        "@itern" => {
            arity(name, args, 1)?;
            next_index(args[0], heap.string(r).chars)
        }
        "@iter" => {
            arity(name, args, 1)?;
            let index = expect_number(name, args[0])? as usize;
            match string_char_at(heap, r, index) {
                Some(c) => Ok(heap.intern_value(&c)),
                None => Ok(Value::Nil),
            }
        }
        _ => Err(format!("string has no method {}()", name)),
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "length" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.list(r).items.len() as f64))
        }
        "append" => {
            arity(name, args, 1)?;
            heap.list_mut(r).items.push(args[0]);
            Ok(Value::Nil)
        }
        "clear" => {
            arity(name, args, 0)?;
            heap.list_mut(r).items.clear();
            Ok(Value::Nil)
        }
        "clone" => {
            arity(name, args, 0)?;
            let items = heap.list(r).items.clone();
            Ok(heap.alloc_list(items))
        }
        "count" => {
            arity(name, args, 1)?;
            let count = heap.list(r).items.iter().filter(|v| **v == args[0]).count();
            Ok(Value::Number(count as f64))
        }
        "extend" => {
            arity(name, args, 1)?;
            let other = args[0]
                .as_obj()
                .filter(|o| matches!(heap.get(*o), Obj::List(_)))
                .ok_or_else(|| "extend() expects a list argument".to_string())?;
            let items = heap.list(other).items.clone();
            heap.list_mut(r).items.extend(items);
            Ok(Value::Nil)
        }
        "index_of" => {
            arity(name, args, 1)?;
            let index = heap.list(r).items.iter().position(|v| *v == args[0]);
            Ok(Value::Number(index.map(|i| i as f64).unwrap_or(-1.0)))
        }
        "insert" => {
            arity(name, args, 2)?;
            let index = expect_number(name, args[1])? as usize;
            let list = heap.list_mut(r);
            let index = index.min(list.items.len());
            list.items.insert(index, args[0]);
            Ok(Value::Nil)
        }
        "pop" => {
            arity(name, args, 0)?;
            Ok(heap.list_mut(r).items.pop().unwrap_or(Value::Nil))
        }
        "shift" => {
            arity(name, args, 0)?;
            let list = heap.list_mut(r);
            if list.items.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(list.items.remove(0))
            }
        }
        "reverse" => {
            arity(name, args, 0)?;
            let mut items = heap.list(r).items.clone();
            items.reverse();
            Ok(heap.alloc_list(items))
        }
        "contains" => {
            arity(name, args, 1)?;
            Ok(Value::Bool(heap.list(r).items.contains(&args[0])))
        }
        "first" => {
            arity(name, args, 0)?;
            Ok(heap.list(r).items.first().copied().unwrap_or(Value::Nil))
        }
        "last" => {
            arity(name, args, 0)?;
            Ok(heap.list(r).items.last().copied().unwrap_or(Value::Nil))
        }
        "take" => {
            arity(name, args, 1)?;
            let n = expect_number(name, args[0])?;
            let list = heap.list(r);
            let n = if n < 0.0 {
                list.items.len().saturating_sub((-n) as usize)
            } else {
                (n as usize).min(list.items.len())
            };
            let items = list.items[..n].to_vec();
            Ok(heap.alloc_list(items))
        }
        "get" => {
            if args.len() != 1 && args.len() != 2 {
                return Err("get() expects 1 or 2 arguments".to_string());
            }
            let index = expect_number(name, args[0])?;
            let fallback = args.get(1).copied().unwrap_or(Value::Nil);
            let list = heap.list(r);
            let index = if index < 0.0 {
                list.items.len() as i64 + index as i64
            } else {
                index as i64
            };
            if index < 0 || index as usize >= list.items.len() {
                Ok(fallback)
            } else {
                Ok(list.items[index as usize])
            }
        }
        "compact" => {
            arity(name, args, 0)?;
            let items: Vec<Value> = heap
                .list(r)
                .items
                .iter()
                .copied()
                .filter(|v| !v.is_nil())
                .collect();
            Ok(heap.alloc_list(items))
        }
        "to_dict" => {
            arity(name, args, 0)?;
            let items = heap.list(r).items.clone();
            let dict = heap.alloc_dict();
            let dict_ref = dict.as_obj().unwrap();
            for (i, item) in items.into_iter().enumerate() {
                let key = Value::Number(i as f64);
                let hash = hash_value(heap, key);
                let d = heap.dict_mut(dict_ref);
                if d.table.set(hash, key, item) {
                    d.keys.push(key);
                }
            }
            Ok(dict)
        }
        "@itern" => {
            arity(name, args, 1)?;
            next_index(args[0], heap.list(r).items.len())
        }
        "@iter" => {
            arity(name, args, 1)?;
            let index = expect_number(name, args[0])? as usize;
            Ok(heap.list(r).items.get(index).copied().unwrap_or(Value::Nil))
        }
        _ => Err(format!("list has no method {}()", name)),
    }
}

// ---------------------------------------------------------------------------
// dictionary
// ---------------------------------------------------------------------------

/// Insert preserving order; returns false when the key already existed.
pub fn dict_set(heap: &mut Heap, dict: ObjRef, key: Value, value: Value) -> bool {
    let hash = hash_value(heap, key);
    let d = heap.dict_mut(dict);
    let is_new = d.table.set(hash, key, value);
    if is_new {
        d.keys.push(key);
    }
    is_new
}

pub fn dict_get(heap: &Heap, dict: ObjRef, key: Value) -> Option<Value> {
    let hash = hash_value(heap, key);
    heap.dict(dict).table.get(hash, key)
}

fn dict_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "length" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.dict(r).keys.len() as f64))
        }
        "add" => {
            arity(name, args, 2)?;
            if !dict_set(heap, r, args[0], args[1]) {
                return Err(format!(
                    "duplicate key {} in dictionary",
                    stringify(heap, args[0])
                ));
            }
            Ok(Value::Nil)
        }
        "set" => {
            arity(name, args, 2)?;
            dict_set(heap, r, args[0], args[1]);
            Ok(Value::Nil)
        }
        "clear" => {
            arity(name, args, 0)?;
            let d = heap.dict_mut(r);
            d.keys.clear();
            d.table = Table::new();
            Ok(Value::Nil)
        }
        "clone" => {
            arity(name, args, 0)?;
            let keys = heap.dict(r).keys.clone();
            let table = heap.dict(r).table.clone();
            Ok(Value::Obj(heap.alloc(Obj::Dict(crate::heap::DictObj { keys, table }))))
        }
        "contains" => {
            arity(name, args, 1)?;
            Ok(Value::Bool(dict_get(heap, r, args[0]).is_some()))
        }
        "extend" => {
            arity(name, args, 1)?;
            let other = args[0]
                .as_obj()
                .filter(|o| matches!(heap.get(*o), Obj::Dict(_)))
                .ok_or_else(|| "extend() expects a dictionary argument".to_string())?;
            let keys = heap.dict(other).keys.clone();
            for key in keys {
                let value = dict_get(heap, other, key).unwrap_or(Value::Nil);
                dict_set(heap, r, key, value);
            }
            Ok(Value::Nil)
        }
        "get" => {
            if args.len() != 1 && args.len() != 2 {
                return Err("get() expects 1 or 2 arguments".to_string());
            }
            let fallback = args.get(1).copied().unwrap_or(Value::Nil);
            Ok(dict_get(heap, r, args[0]).unwrap_or(fallback))
        }
        "keys" => {
            arity(name, args, 0)?;
            let keys = heap.dict(r).keys.clone();
            Ok(heap.alloc_list(keys))
        }
        "values" => {
            arity(name, args, 0)?;
            let keys = heap.dict(r).keys.clone();
            let values: Vec<Value> = keys
                .iter()
                .map(|k| dict_get(heap, r, *k).unwrap_or(Value::Nil))
                .collect();
            Ok(heap.alloc_list(values))
        }
        "remove" => {
            arity(name, args, 1)?;
            let hash = hash_value(heap, args[0]);
            let d = heap.dict_mut(r);
            let existing = d.table.get(hash, args[0]);
            if existing.is_some() {
                d.table.delete(hash, args[0]);
                d.keys.retain(|k| *k != args[0]);
            }
            Ok(existing.unwrap_or(Value::Nil))
        }
        "to_list" => {
            // [keys, values] pairing, insertion-ordered.
            arity(name, args, 0)?;
            let keys = heap.dict(r).keys.clone();
            let values: Vec<Value> = keys
                .iter()
                .map(|k| dict_get(heap, r, *k).unwrap_or(Value::Nil))
                .collect();
            let keys_list = heap.alloc_list(keys);
            let values_list = heap.alloc_list(values);
            Ok(heap.alloc_list(vec![keys_list, values_list]))
        }
        "@itern" => {
            arity(name, args, 1)?;
            let d = heap.dict(r);
            match args[0] {
                Value::Nil => Ok(d.keys.first().copied().unwrap_or(Value::Nil)),
                previous => {
                    let position = d.keys.iter().position(|k| *k == previous);
                    match position {
                        Some(i) => Ok(d.keys.get(i + 1).copied().unwrap_or(Value::Nil)),
                        None => Err("invalid iteration key for dictionary".to_string()),
                    }
                }
            }
        }
        "@iter" => {
            arity(name, args, 1)?;
            Ok(dict_get(heap, r, args[0]).unwrap_or(Value::Nil))
        }
        _ => Err(format!("dictionary has no method {}()", name)),
    }
}

// ---------------------------------------------------------------------------
// bytes
// ---------------------------------------------------------------------------

fn bytes_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "length" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.bytes(r).bytes.len() as f64))
        }
        "append" => {
            arity(name, args, 1)?;
            let byte = expect_number(name, args[0])?;
            heap.bytes_mut(r).bytes.push(byte as i64 as u8);
            Ok(Value::Nil)
        }
        "clone" => {
            arity(name, args, 0)?;
            let bytes = heap.bytes(r).bytes.clone();
            Ok(heap.alloc_bytes(bytes))
        }
        "extend" => {
            arity(name, args, 1)?;
            let other = args[0]
                .as_obj()
                .filter(|o| matches!(heap.get(*o), Obj::Bytes(_)))
                .ok_or_else(|| "extend() expects a bytes argument".to_string())?;
            let bytes = heap.bytes(other).bytes.clone();
            heap.bytes_mut(r).bytes.extend(bytes);
            Ok(Value::Nil)
        }
        "first" => {
            arity(name, args, 0)?;
            Ok(heap
                .bytes(r)
                .bytes
                .first()
                .map(|b| Value::Number(*b as f64))
                .unwrap_or(Value::Nil))
        }
        "last" => {
            arity(name, args, 0)?;
            Ok(heap
                .bytes(r)
                .bytes
                .last()
                .map(|b| Value::Number(*b as f64))
                .unwrap_or(Value::Nil))
        }
        "get" => {
            arity(name, args, 1)?;
            let index = expect_number(name, args[0])? as usize;
            Ok(heap
                .bytes(r)
                .bytes
                .get(index)
                .map(|b| Value::Number(*b as f64))
                .unwrap_or(Value::Nil))
        }
        "reverse" => {
            arity(name, args, 0)?;
            let mut bytes = heap.bytes(r).bytes.clone();
            bytes.reverse();
            Ok(heap.alloc_bytes(bytes))
        }
        "to_list" => {
            arity(name, args, 0)?;
            let items: Vec<Value> = heap
                .bytes(r)
                .bytes
                .iter()
                .map(|b| Value::Number(*b as f64))
                .collect();
            Ok(heap.alloc_list(items))
        }
        "to_string" => {
            arity(name, args, 0)?;
            let text = String::from_utf8_lossy(&heap.bytes(r).bytes).into_owned();
            Ok(heap.intern_value(&text))
        }
        "@itern" => {
            arity(name, args, 1)?;
            next_index(args[0], heap.bytes(r).bytes.len())
        }
        "@iter" => {
            arity(name, args, 1)?;
            let index = expect_number(name, args[0])? as usize;
            Ok(heap
                .bytes(r)
                .bytes
                .get(index)
                .map(|b| Value::Number(*b as f64))
                .unwrap_or(Value::Nil))
        }
        _ => Err(format!("bytes has no method {}()", name)),
    }
}

// ---------------------------------------------------------------------------
// range
// ---------------------------------------------------------------------------

fn range_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "lower" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.range(r).lower as f64))
        }
        "upper" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.range(r).upper as f64))
        }
        "range" => {
            arity(name, args, 0)?;
            Ok(Value::Number(heap.range(r).length as f64))
        }
        "to_list" => {
            arity(name, args, 0)?;
            let range = heap.range(r);
            let (lower, upper, length) = (range.lower, range.upper, range.length);
            let step: i64 = if upper >= lower { 1 } else { -1 };
            let items: Vec<Value> = (0..length)
                .map(|i| Value::Number((lower + step * i) as f64))
                .collect();
            Ok(heap.alloc_list(items))
        }
        "@itern" => {
            arity(name, args, 1)?;
            next_index(args[0], heap.range(r).length as usize)
        }
        "@iter" => {
            arity(name, args, 1)?;
            let index = expect_number(name, args[0])? as i64;
            let range = heap.range(r);
            if index < 0 || index >= range.length {
                return Ok(Value::Nil);
            }
            let step: i64 = if range.upper >= range.lower { 1 } else { -1 };
            Ok(Value::Number((range.lower + step * index) as f64))
        }
        _ => Err(format!("range has no method {}()", name)),
    }
}

// ---------------------------------------------------------------------------
// file
// ---------------------------------------------------------------------------

fn file_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> MethodResult {
    match name {
        "path" => {
            arity(name, args, 0)?;
            let path = match heap.get(r) {
                Obj::File(f) => f.path.clone(),
                _ => unreachable!(),
            };
            Ok(heap.intern_value(&path))
        }
        "mode" => {
            arity(name, args, 0)?;
            let mode = match heap.get(r) {
                Obj::File(f) => f.mode.clone(),
                _ => unreachable!(),
            };
            Ok(heap.intern_value(&mode))
        }
        "is_open" => {
            arity(name, args, 0)?;
            let open = match heap.get(r) {
                Obj::File(f) => f.handle.is_some(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(open))
        }
        "close" => {
            arity(name, args, 0)?;
            heap.file_mut(r).handle = None;
            Ok(Value::Nil)
        }
        _ => Err(format!("file has no method {}()", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_length_counts_code_points() {
        let mut heap = Heap::new();
        let s = heap.intern("héllo");
        let out = dispatch(&mut heap, Value::Obj(s), "length", &[]).unwrap().unwrap();
        assert_eq!(out.as_number(), Some(5.0));
    }

    #[test]
    fn list_append_mutates_in_place() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        dispatch(&mut heap, list, "append", &[Value::Number(1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(heap.list(list.as_obj().unwrap()).items.len(), 1);
    }

    #[test]
    fn dict_preserves_insertion_order() {
        let mut heap = Heap::new();
        let dict = heap.alloc_dict();
        let dict_ref = dict.as_obj().unwrap();
        let b = heap.intern_value("b");
        let a = heap.intern_value("a");
        dict_set(&mut heap, dict_ref, b, Value::Number(1.0));
        dict_set(&mut heap, dict_ref, a, Value::Number(2.0));
        let keys = dispatch(&mut heap, dict, "keys", &[]).unwrap().unwrap();
        let keys = heap.list(keys.as_obj().unwrap());
        assert_eq!(keys.items, vec![b, a]);
    }

    #[test]
    fn iteration_protocol_walks_a_list() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(vec![Value::Number(10.0), Value::Number(20.0)]);
        let k0 = dispatch(&mut heap, list, "@itern", &[Value::Nil]).unwrap().unwrap();
        assert_eq!(k0.as_number(), Some(0.0));
        let v0 = dispatch(&mut heap, list, "@iter", &[k0]).unwrap().unwrap();
        assert_eq!(v0.as_number(), Some(10.0));
        let k1 = dispatch(&mut heap, list, "@itern", &[k0]).unwrap().unwrap();
        let k2 = dispatch(&mut heap, list, "@itern", &[k1]).unwrap().unwrap();
        assert!(k2.is_nil());
    }

    #[test]
    fn empty_containers_iterate_zero_times() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        let first = dispatch(&mut heap, list, "@itern", &[Value::Nil]).unwrap().unwrap();
        assert!(first.is_nil());
        let empty = heap.intern_value("");
        let first = dispatch(&mut heap, empty, "@itern", &[Value::Nil]).unwrap().unwrap();
        assert!(first.is_nil());
    }

    #[test]
    fn descending_range_iterates_downward() {
        let mut heap = Heap::new();
        let range = heap.alloc_range(3, 0);
        let out = dispatch(&mut heap, range, "to_list", &[]).unwrap().unwrap();
        let items = &heap.list(out.as_obj().unwrap()).items;
        let numbers: Vec<f64> = items.iter().map(|v| v.as_number().unwrap()).collect();
        assert_eq!(numbers, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn unknown_method_reports_receiver_type() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        let err = dispatch(&mut heap, list, "bogus", &[]).unwrap().unwrap_err();
        assert!(err.contains("list"));
    }

    #[test]
    fn non_container_receivers_are_not_dispatched() {
        let mut heap = Heap::new();
        assert!(dispatch(&mut heap, Value::Number(1.0), "length", &[]).is_none());
    }

    #[test]
    fn method_membership_mirrors_dispatch() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        assert_eq!(has_method(&heap, list, "append"), Some(true));
        assert_eq!(has_method(&heap, list, "bogus"), Some(false));
        let range = heap.alloc_range(0, 3);
        assert_eq!(has_method(&heap, range, "lower"), Some(true));
        assert_eq!(has_method(&heap, range, "length"), Some(false));
        assert_eq!(has_method(&heap, Value::Number(1.0), "length"), None);
    }
}
