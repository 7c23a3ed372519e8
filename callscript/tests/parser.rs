use callscript::ast::{Arg, RValue, Stmt};
use callscript::parser::parse_program;
use callscript::values::Value;

#[test]
fn parses_bare_call() {
    let program = parse_program("double(21)").unwrap();
    assert_eq!(program.statements.len(), 1);
    match &program.statements[0] {
        Stmt::Expr(RValue::Call(call)) => {
            assert_eq!(call.function, "double");
            assert_eq!(call.args, vec![Arg::Literal(Value::Int(21))]);
            assert!(call.kwargs.is_empty());
        }
        other => panic!("unexpected statement: {:?}", other),
    }
}

#[test]
fn parses_assignment_chain() {
    let program = parse_program("v = add(2, 3)\ndouble(v)").unwrap();
    assert_eq!(program.statements.len(), 2);
    match &program.statements[0] {
        Stmt::Assign { name, value } => {
            assert_eq!(name, "v");
            assert!(matches!(value, RValue::Call(_)));
        }
        other => panic!("unexpected statement: {:?}", other),
    }
    match &program.statements[1] {
        Stmt::Expr(RValue::Call(call)) => {
            assert_eq!(call.args, vec![Arg::Name("v".to_string())]);
        }
        other => panic!("unexpected statement: {:?}", other),
    }
}

#[test]
fn parses_keyword_arguments() {
    let program = parse_program("search(\"rust\", limit=5, exact=True)").unwrap();
    match &program.statements[0] {
        Stmt::Expr(RValue::Call(call)) => {
            assert_eq!(call.args, vec![Arg::Literal(Value::Str("rust".into()))]);
            assert_eq!(
                call.kwargs,
                vec![
                    ("limit".to_string(), Arg::Literal(Value::Int(5))),
                    ("exact".to_string(), Arg::Literal(Value::Bool(true))),
                ]
            );
        }
        other => panic!("unexpected statement: {:?}", other),
    }
}

#[test]
fn parses_collection_literals() {
    let program = parse_program("plot([1, 2.5, \"x\"], style={'color': 'red'})").unwrap();
    match &program.statements[0] {
        Stmt::Expr(RValue::Call(call)) => {
            assert_eq!(
                call.args[0],
                Arg::Literal(Value::List(vec![
                    Value::Int(1),
                    Value::Float(2.5),
                    Value::Str("x".into()),
                ]))
            );
            let (key, style) = &call.kwargs[0];
            assert_eq!(key, "style");
            match style {
                Arg::Literal(Value::Map(m)) => {
                    assert_eq!(m.get("color"), Some(&Value::Str("red".into())));
                }
                other => panic!("unexpected kwarg: {:?}", other),
            }
        }
        other => panic!("unexpected statement: {:?}", other),
    }
}

#[test]
fn parses_literal_assignment_and_none() {
    let program = parse_program("x = None\ny = 'hi'\nshow(x, y)").unwrap();
    assert_eq!(program.statements.len(), 3);
    assert_eq!(program.call_count(), 1);
    match &program.statements[0] {
        Stmt::Assign { value, .. } => assert_eq!(value, &RValue::Literal(Value::Null)),
        other => panic!("unexpected statement: {:?}", other),
    }
}

#[test]
fn tolerates_blank_lines_and_comments() {
    let source = "\n# warm up\nv = add(1, 2)\n\n\ndouble(v)  # chain\n";
    let program = parse_program(source).unwrap();
    assert_eq!(program.statements.len(), 2);
}

#[test]
fn rejects_nested_calls() {
    assert!(parse_program("double(add(1, 2))").is_err());
}

#[test]
fn rejects_arithmetic() {
    assert!(parse_program("x = 1 + 2").is_err());
    assert!(parse_program("double(2 * 3)").is_err());
}

#[test]
fn rejects_attribute_access_and_imports() {
    assert!(parse_program("os.system(\"rm\")").is_err());
    assert!(parse_program("import os").is_err());
}

#[test]
fn rejects_positional_after_keyword() {
    assert!(parse_program("f(a=1, 2)").is_err());
}

#[test]
fn rejects_control_flow() {
    assert!(parse_program("if x:\n    f()").is_err());
    assert!(parse_program("for i in xs: f(i)").is_err());
}

#[test]
fn string_escapes_are_decoded() {
    let program = parse_program("say(\"line\\none\\ttab\")").unwrap();
    match &program.statements[0] {
        Stmt::Expr(RValue::Call(call)) => {
            assert_eq!(call.args[0], Arg::Literal(Value::Str("line\none\ttab".into())));
        }
        other => panic!("unexpected statement: {:?}", other),
    }
}
