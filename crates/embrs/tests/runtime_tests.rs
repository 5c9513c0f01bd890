use embrs::{Error, NativeValue, Runtime, Value};
use pretty_assertions::assert_eq;

fn run(source: &str) -> Vec<String> {
    let mut runtime = Runtime::new();
    runtime.capture(source).unwrap().lines
}

fn run_err(source: &str) -> Error {
    let mut runtime = Runtime::new();
    runtime.capture(source).unwrap_err()
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(run("echo 1 + 2 * 3\n"), vec!["7"]);
    assert_eq!(run("echo (1 + 2) * 3\n"), vec!["9"]);
    assert_eq!(run("echo 2 ** 8\n"), vec!["256"]);
    assert_eq!(run("echo 7 // 2\n"), vec!["3"]);
    assert_eq!(run("echo 10 % 3\n"), vec!["1"]);
    assert_eq!(run("echo -7 % 3\n"), vec!["2"]);
    assert_eq!(run("echo 1 < 2 and 3 > 2\n"), vec!["true"]);
    assert_eq!(run("echo 6 & 3\necho 6 | 3\necho 6 ^ 3\n"), vec!["2", "7", "5"]);
    assert_eq!(run("echo 1 << 4\necho 256 >> 4\n"), vec!["16", "16"]);
}

#[test]
fn division_follows_ieee() {
    assert_eq!(run("echo 1 / 0\n"), vec!["inf"]);
    assert_eq!(run("echo -1 / 0\n"), vec!["-inf"]);
    assert_eq!(run("echo 5 % 0\n"), vec!["nan"]);
}

#[test]
fn string_concatenation_and_coercion() {
    assert_eq!(run("echo \"a\" + \"b\"\n"), vec!["ab"]);
    assert_eq!(run("echo \"n = \" + 4\n"), vec!["n = 4"]);
    assert_eq!(run("echo \"ab\" * 3\n"), vec!["ababab"]);
    // nil is absorbed by concatenation; booleans refuse it outright.
    assert_eq!(run("echo \"x\" + nil\n"), vec!["x"]);
    assert_eq!(run("echo nil + \"x\"\n"), vec!["x"]);
    let err = run_err("echo \"x\" + true\n");
    assert!(err.to_string().contains("unsupported operand +"));
}

#[test]
fn variables_and_compound_assignment() {
    assert_eq!(
        run("var x = 10\nx += 5\nx *= 2\necho x\n"),
        vec!["30"]
    );
    assert_eq!(run("var x = 1\nx++\nx++\necho x\n"), vec!["3"]);
    assert_eq!(run("var x = 5\nx--\necho x\n"), vec!["4"]);
    assert_eq!(run("var a = 1, b = 2\necho a + b\n"), vec!["3"]);
}

#[test]
fn truthiness_rules() {
    // Negative numbers are falsey; zero is truthy.
    assert_eq!(run("if -1 { echo \"yes\" } else { echo \"no\" }\n"), vec!["no"]);
    assert_eq!(run("if 0 { echo \"yes\" } else { echo \"no\" }\n"), vec!["yes"]);
    assert_eq!(run("if \"\" { echo \"yes\" } else { echo \"no\" }\n"), vec!["no"]);
    assert_eq!(run("if [] { echo \"yes\" } else { echo \"no\" }\n"), vec!["no"]);
    // A zero-length range is still truthy, unlike a zero-length list.
    assert_eq!(run("if 0..0 { echo \"yes\" } else { echo \"no\" }\n"), vec!["yes"]);
}

#[test]
fn while_and_do_while_loops() {
    assert_eq!(
        run("var i = 0\nwhile i < 3 { echo i\ni++\n }\n"),
        vec!["0", "1", "2"]
    );
    assert_eq!(
        run("var i = 5\ndo { echo i\ni++\n } while i < 3\n"),
        vec!["5"]
    );
}

#[test]
fn classic_for_loop() {
    assert_eq!(
        run("for var i = 0; i < 3; i++ { echo i }\n"),
        vec!["0", "1", "2"]
    );
    // An empty iteration space never enters the body.
    assert_eq!(run("for var i = 0; i < 0; i++ { echo i }\necho \"done\"\n"), vec!["done"]);
}

#[test]
fn break_and_continue() {
    assert_eq!(
        run("var i = 0\nwhile true { i++\nif i == 2 { continue }\nif i > 4 { break }\necho i\n }\n"),
        vec!["1", "3", "4"]
    );
}

#[test]
fn foreach_over_containers() {
    assert_eq!(run("foreach v in [10, 20, 30] { echo v }\n"), vec!["10", "20", "30"]);
    assert_eq!(run("foreach v in [] { echo v }\necho \"end\"\n"), vec!["end"]);
    assert_eq!(run("foreach c in \"abc\" { echo c }\n"), vec!["a", "b", "c"]);
    assert_eq!(run("foreach v in 0..3 { echo v }\n"), vec!["0", "1", "2"]);
    assert_eq!(run("foreach v in 3..0 { echo v }\n"), vec!["3", "2", "1"]);
    assert_eq!(
        run("foreach k, v in {a: 1, b: 2} { echo \"${k}=${v}\" }\n"),
        vec!["a=1", "b=2"]
    );
}

#[test]
fn functions_pad_missing_arguments_with_nil() {
    assert_eq!(
        run("def f(a, b) { if b == nil { echo \"padded\" } else { echo b } }\nf(1)\nf(1, 2)\n"),
        vec!["padded", "2"]
    );
}

#[test]
fn closure_captures_shared_state() {
    // The captured variable outlives its frame.
    assert_eq!(
        run("var mk = |x| { return || { x = x + 1\nreturn x } }\nvar c = mk(10)\necho c()\necho c()\necho c()\n"),
        vec!["11", "12", "13"]
    );
}

#[test]
fn two_closures_share_one_upvalue() {
    let source = r#"
def pair() {
  var n = 0
  var inc = || {
    n = n + 1
    return n
  }
  var get = || { return n }
  inc()
  inc()
  return get()
}
echo pair()
"#;
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn variadic_collects_into_args_list() {
    // A trailing ... binds the excess arguments to __args__.
    assert_eq!(
        run("def sum(...) { var s = 0\nforeach v in __args__ { s = s + v }\nreturn s }\necho sum(1, 2, 3, 4)\n"),
        vec!["10"]
    );
    assert_eq!(run("def count(...) { var n = 0\nforeach v in __args__ { n++ }\nreturn n }\necho count()\n"), vec!["0"]);
}

#[test]
fn method_resolution_with_inheritance() {
    // parent dispatch starts the lookup at the superclass.
    assert_eq!(
        run("class A { def f() { return \"A\" } }\nclass B < A { def f() { return parent.f() + \"B\" } }\necho B().f()\n"),
        vec!["AB"]
    );
}

#[test]
fn inherited_methods_and_fields() {
    let source = "class A { var tag = \"a\"\ndef hello() { return \"hi\" } }\nclass B < A { }\nvar b = B()\necho b.hello()\necho b.tag\n";
    assert_eq!(run(source), vec!["hi", "a"]);
}

#[test]
fn initializer_sets_fields() {
    let source = "class Point { var x = 0\nvar y = 0\nPoint(x, y) { self.x = x\nself.y = y }\ndef sum() { return self.x + self.y } }\necho Point(3, 4).sum()\n";
    assert_eq!(run(source), vec!["7"]);
}

#[test]
fn instance_fields_copy_class_defaults() {
    let source = "class Box { var items = [] }\nvar a = Box()\nvar b = Box()\na.items.append(1)\necho a.items.length\necho b.items.length\n";
    assert_eq!(run(source), vec!["1", "0"]);
}

#[test]
fn static_methods_are_class_only() {
    assert_eq!(
        run("class M { static def twice(n) { return n * 2 } }\necho M.twice(21)\n"),
        vec!["42"]
    );
}

#[test]
fn private_methods_are_self_only() {
    let source = "class S { def _secret() { return 42 }\ndef reveal() { return self._secret() } }\necho S().reveal()\n";
    assert_eq!(run(source), vec!["42"]);
    let err = run_err("class S { def _secret() { return 42 } }\necho S()._secret()\n");
    assert!(err.to_string().contains("private"));
}

#[test]
fn to_string_hook_is_used_by_interpolation() {
    let source = "class P { var x = 1\ndef @to_string() { return \"P(${self.x})\" } }\necho \"got ${P()}\"\n";
    assert_eq!(run(source), vec!["got P(1)"]);
}

#[test]
fn user_iteration_protocol_drives_foreach() {
    let source = r#"
class Twice {
  def @itern(k) {
    if k == nil { return 0 }
    if k < 1 { return k + 1 }
    return nil
  }
  def @iter(k) { return (k + 1) * 10 }
}
foreach v in Twice() { echo v }
"#;
    assert_eq!(run(source), vec!["10", "20"]);
}

#[test]
fn exception_with_catch_and_finally() {
    // catch binds the exception; finally always runs.
    assert_eq!(
        run("try { die Exception(\"boom\") } catch Exception e { echo e.message } finally { echo \"done\" }\n"),
        vec!["boom", "done"]
    );
}

#[test]
fn finally_without_catch_reraises() {
    let mut runtime = Runtime::new();
    let result = runtime.capture("try { die Exception(\"E\") } finally { echo \"fin\" }\n");
    let err = result.unwrap_err();
    match &err {
        Error::Runtime { message, .. } => assert_eq!(message, "E"),
        other => panic!("expected runtime error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 11);
}

#[test]
fn finally_runs_on_the_normal_path_exactly_once() {
    assert_eq!(
        run("try { echo \"body\" } finally { echo \"fin\" }\necho \"after\"\n"),
        vec!["body", "fin", "after"]
    );
}

#[test]
fn runtime_errors_are_catchable() {
    assert_eq!(
        run("try { echo missing } catch Exception e { echo \"caught\" }\n"),
        vec!["caught"]
    );
    assert_eq!(
        run("try { echo 1 - [] } catch Exception e { echo e.message }\n"),
        vec!["unsupported operand - for number and list"]
    );
}

#[test]
fn exceptions_propagate_across_frames() {
    let source = "def inner() { die Exception(\"deep\") }\ndef outer() { inner() }\ntry { outer() } catch Exception e { echo e.message }\n";
    assert_eq!(run(source), vec!["deep"]);
}

#[test]
fn uncaught_exceptions_carry_a_stacktrace() {
    let err = run_err("def f() { die Exception(\"boom\") }\nf()\n");
    match err {
        Error::Runtime { class, message, stacktrace } => {
            assert_eq!(class, "Exception");
            assert_eq!(message, "boom");
            assert!(stacktrace.contains("f()"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn assert_raises_illegal_state() {
    assert_eq!(run("assert 1 < 2\necho \"ok\"\n"), vec!["ok"]);
    let err = run_err("assert 1 > 2, \"broken math\"\n");
    match err {
        Error::Runtime { class, message, .. } => {
            assert_eq!(class, "IllegalState");
            assert_eq!(message, "broken math");
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn switch_dispatch() {
    // Multi-value cases share one body; default catches the rest.
    let source = "def t(x) { using x { when 1: return \"one\"\nwhen 2, 3: return \"two-three\"\ndefault: return \"other\" } }\necho t(2)\necho t(5)\n";
    assert_eq!(run(source), vec!["two-three", "other"]);
}

#[test]
fn switch_on_strings_and_bools() {
    let source = "def t(x) { using x { when \"a\": return 1\nwhen true: return 2\ndefault: return 3 } }\necho t(\"a\")\necho t(true)\necho t(9)\n";
    assert_eq!(run(source), vec!["1", "2", "3"]);
}

#[test]
fn utf8_strings_index_by_code_point() {
    // length and indexing count characters, not bytes.
    assert_eq!(run("var s = \"héllo\"\necho s.length\necho s[1]\n"), vec!["5", "é"]);
}

#[test]
fn negative_indices_wrap() {
    assert_eq!(run("var l = [1, 2, 3]\necho l[-1]\n"), vec!["3"]);
    assert_eq!(run("var s = \"abc\"\necho s[-2]\n"), vec!["b"]);
}

#[test]
fn ranged_indexing_slices() {
    assert_eq!(run("var l = [1, 2, 3, 4]\necho l[1, 3]\n"), vec!["[2, 3]"]);
    assert_eq!(run("var l = [1, 2, 3, 4]\necho l[,2]\n"), vec!["[1, 2]"]);
    assert_eq!(run("var l = [1, 2, 3, 4]\necho l[2,]\n"), vec!["[3, 4]"]);
    assert_eq!(run("var s = \"hello\"\necho s[1, 4]\n"), vec!["ell"]);
}

#[test]
fn dict_literals_and_indexing() {
    assert_eq!(run("var d = {a: 1, \"b\": 2}\necho d[\"a\"] + d[\"b\"]\n"), vec!["3"]);
    assert_eq!(run("var d = {}\nd[\"k\"] = 9\necho d.k\n"), vec!["9"]);
    let err = run_err("var d = {a: 1}\necho d[\"zz\"]\n");
    assert!(err.to_string().contains("invalid index"));
}

#[test]
fn unknown_builtin_properties_raise_eagerly() {
    let err = run_err("var l = [1]\nvar m = l.bogus\n");
    assert!(err.to_string().contains("no named property 'bogus'"));
    let err = run_err("echo \"s\".missing\n");
    assert!(err.to_string().contains("no named property"));
    let err = run_err("echo (0..3).length\n");
    assert!(err.to_string().contains("no named property"));
    // A known method accessed without a call binds to its receiver.
    assert_eq!(run("var f = [1, 2].pop\necho f()\n"), vec!["2"]);
}

#[test]
fn list_methods() {
    assert_eq!(
        run("var l = [3, 1]\nl.append(2)\necho l.length\necho l.contains(2)\necho l.reverse()\n"),
        vec!["3", "true", "[2, 1, 3]"]
    );
    assert_eq!(run("var l = [1, 2, 3]\necho l.pop()\necho l.length\n"), vec!["3", "2"]);
}

#[test]
fn string_methods() {
    assert_eq!(run("echo \"Hello\".upper()\n"), vec!["HELLO"]);
    assert_eq!(run("echo \" pad \".trim()\n"), vec!["pad"]);
    assert_eq!(run("echo \"a,b,c\".split(\",\")\n"), vec!["['a', 'b', 'c']"]);
    assert_eq!(run("echo \"hello\".index_of(\"llo\")\n"), vec!["2"]);
    assert_eq!(run("echo \"42.5\".to_number() + 0.5\n"), vec!["43"]);
}

#[test]
fn number_string_round_trip() {
    // to_number(to_string(n)) == n for finite n.
    assert_eq!(
        run("var n = 1.25\nvar s = \"${n}\"\necho s.to_number() == n\n"),
        vec!["true"]
    );
}

#[test]
fn bytes_round_trip_through_lists() {
    assert_eq!(
        run("var b = \"abc\".to_bytes()\necho b.length\necho b.to_list()\necho b.to_string()\n"),
        vec!["3", "[97, 98, 99]", "abc"]
    );
}

#[test]
fn string_interpolation_nests() {
    assert_eq!(run("var x = 2\necho \"a ${x} b ${x * 2} c\"\n"), vec!["a 2 b 4 c"]);
    assert_eq!(run("var x = 1\necho \"outer ${\"inner ${x}\"}\"\n"), vec!["outer inner 1"]);
}

#[test]
fn ternary_conditional() {
    assert_eq!(run("echo 1 < 2 ? \"yes\" : \"no\"\n"), vec!["yes"]);
    assert_eq!(run("echo -1 ? \"yes\" : \"no\"\n"), vec!["no"]);
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(
        run("def boom() { die Exception(\"called\") }\necho false and boom()\necho true or boom()\n"),
        vec!["false", "true"]
    );
}

#[test]
fn stack_overflow_raises_instead_of_crashing() {
    let err = run_err("def f() { return f() }\nf()\n");
    match err {
        Error::Runtime { message, .. } => assert!(message.contains("stack overflow")),
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn compile_errors_report_file_and_line() {
    let mut runtime = Runtime::new();
    let err = runtime.capture("var x = (1 + \n").unwrap_err();
    assert_eq!(err.exit_code(), 10);
    let rendered = err.to_string();
    assert!(rendered.contains("<capture>"));
    assert!(rendered.contains("error:"));
}

#[test]
fn anonymous_functions_are_first_class() {
    assert_eq!(
        run("var apply = |f, v| { return f(v) }\necho apply(|n| { return n + 1 }, 41)\n"),
        vec!["42"]
    );
}

#[test]
fn modules_import_source_files() {
    let dir = std::env::temp_dir().join("embrs-import-test");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("mathutil.em"),
        "def double(n) { return n * 2 }\nvar factor = 10\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("main.em"),
        "import .mathutil\necho mathutil.double(21)\nimport .mathutil { factor }\necho factor\n",
    )
    .unwrap();

    let source = std::fs::read_to_string(dir.join("main.em")).unwrap();
    let mut runtime = Runtime::new();
    let output = runtime
        .capture_with_file(&source, dir.join("main.em"))
        .unwrap();
    assert_eq!(output.lines, vec!["42", "10"]);
}

#[test]
fn native_modules_resolve_from_the_registry() {
    let mut runtime = Runtime::new();
    runtime.module("_host", |m| {
        m.field("name", NativeValue::Str("embrs".to_string()));
        m.function("add", |_heap, args| {
            let a = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
            let b = args.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);
            Ok(Value::Number(a + b))
        });
    });
    let output = runtime
        .capture("import _host\necho _host.name\necho _host.add(40, 2)\n")
        .unwrap();
    assert_eq!(output.lines, vec!["embrs", "42"]);
}

#[test]
fn native_function_errors_raise_exceptions() {
    let mut runtime = Runtime::new();
    runtime.module("_fail", |m| {
        m.function("always", |_heap, _args| Err("host refused".to_string()));
    });
    let output = runtime
        .capture("import _fail\ntry { _fail.always() } catch Exception e { echo e.message }\n")
        .unwrap();
    assert_eq!(output.lines, vec!["host refused"]);
}

#[test]
fn repl_mode_echoes_expressions() {
    let mut runtime = Runtime::new();
    runtime.set_repl(true);
    let output = runtime.capture("1 + 2\n").unwrap();
    assert_eq!(output.lines, vec!["3"]);
    // Strings echo quoted in REPL mode.
    let output = runtime.capture("\"hi\"\n").unwrap();
    assert_eq!(output.lines, vec!["'hi'"]);
}

#[test]
fn garbage_is_collected_across_loops() {
    // Churn enough short-lived strings and lists to force several GC
    // cycles; survival of the loop proves collection keeps roots alive.
    let source = "var keep = []\nfor var i = 0; i < 200; i++ {\nvar tmp = \"x\" * 100\nvar l = [tmp, tmp]\nif i % 50 == 0 { keep.append(l) }\n}\necho keep.length\n";
    assert_eq!(run(source), vec!["4"]);
}

#[test]
fn module_as_callable() {
    let dir = std::env::temp_dir().join("embrs-callable-module");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("shout.em"), "def shout(s) { return s.upper() }\n").unwrap();

    let mut runtime = Runtime::new();
    let output = runtime
        .capture_with_file(
            "import .shout\necho shout(\"hey\")\n",
            dir.join("main.em"),
        )
        .unwrap();
    assert_eq!(output.lines, vec!["HEY"]);
}
