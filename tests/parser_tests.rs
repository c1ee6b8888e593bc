// ABOUTME: Integration tests for the streaming parser: chunked feeding,
// checkpointing, reader surface, and error recovery

use lisp_forge::error::ParserUsage;
use lisp_forge::parser::{parse_all, Parser, Status};
use lisp_forge::value::Value;

fn feed(parser: &mut Parser, text: &str) {
    for &b in text.as_bytes() {
        parser.consume(b).expect("parser alive");
        assert_ne!(parser.status(), Status::Error, "error while feeding {:?}", text);
    }
}

fn drain(parser: &mut Parser) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(v) = parser.produce() {
        out.push(v);
    }
    out
}

#[test]
fn test_chunk_size_does_not_matter() {
    let source = "(def x 10) @[1 2 {:a \"b\"}] `long\nstring` 'quoted";
    let whole = parse_all(source).unwrap();
    for chunk in [1usize, 3, 7] {
        let mut parser = Parser::new();
        let mut values = Vec::new();
        for piece in source.as_bytes().chunks(chunk) {
            for &b in piece {
                parser.consume(b).unwrap();
            }
            values.extend(drain(&mut parser));
        }
        parser.eof().unwrap();
        values.extend(drain(&mut parser));
        assert_eq!(values.len(), whole.len(), "chunk size {}", chunk);
        for (a, b) in values.iter().zip(&whole) {
            assert!(a.equals(b), "chunk size {}: {} != {}", chunk, a, b);
        }
    }
}

#[test]
fn test_values_arrive_in_form_order() {
    let values = parse_all("1 (2 3) :four").unwrap();
    assert_eq!(values.len(), 3);
    assert!(values[0].equals(&Value::Integer(1)));
    assert!(matches!(values[1], Value::Tuple(_)));
    assert!(values[2].equals(&Value::keyword("four")));
}

#[test]
fn test_semicolon_is_the_splice_reader_macro() {
    // The splice reader macro wraps the next form; the remaining values
    // follow unchanged.
    let values = parse_all(" ; one\n(def x 10) x ").unwrap();
    assert_eq!(values.len(), 3);
    match &values[0] {
        Value::Tuple(t) => {
            assert!(t.items[0].equals(&Value::symbol("splice")));
            assert!(t.items[1].equals(&Value::symbol("one")));
        }
        other => panic!("expected splice form, got {}", other),
    }
    match &values[1] {
        Value::Tuple(t) => assert!(t.items[0].equals(&Value::symbol("def"))),
        other => panic!("expected def form, got {}", other),
    }
    assert!(values[2].equals(&Value::symbol("x")));
}

#[test]
fn test_long_buffer_literal() {
    let values = parse_all("@`hello`").unwrap();
    match &values[0] {
        Value::Buffer(b) => assert_eq!(&*b.borrow(), b"hello"),
        other => panic!("expected buffer, got {}", other),
    }
}

#[test]
fn test_struct_literal_order_independent() {
    let a = parse_all("{:a 1 :b 2}").unwrap().remove(0);
    let b = parse_all("{:b 2 :a 1}").unwrap().remove(0);
    assert!(a.equals(&b));
    match a {
        Value::Struct(s) => assert_eq!(s.len(), 2),
        other => panic!("expected struct, got {}", other),
    }
}

#[test]
fn test_mutable_prefix_round_trip_law() {
    let array = parse_all("@[1 2]").unwrap().remove(0);
    let tuple = parse_all("[1 2]").unwrap().remove(0);
    assert!(matches!(array, Value::Array(_)));
    assert!(matches!(&tuple, Value::Tuple(t) if t.bracket));
    if let (Value::Array(a), Value::Tuple(t)) = (&array, &tuple) {
        for (x, y) in a.borrow().iter().zip(&t.items) {
            assert!(x.equals(y));
        }
    }
}

#[test]
fn test_quote_reader_law() {
    let quoted = parse_all("'(a b)").unwrap().remove(0);
    let plain = parse_all("(a b)").unwrap().remove(0);
    match quoted {
        Value::Tuple(t) => {
            assert_eq!(t.items.len(), 2);
            assert!(t.items[0].equals(&Value::symbol("quote")));
            assert!(t.items[1].equals(&plain));
        }
        other => panic!("expected quote form, got {}", other),
    }
}

#[test]
fn test_long_string_fence_law() {
    // Content runs to the first matching fence; adjacent newlines strip.
    let v = parse_all("``a ` b``").unwrap().remove(0);
    assert!(v.equals(&Value::str_from(b"a ` b")));
    let v = parse_all("`\ntext\n`").unwrap().remove(0);
    assert!(v.equals(&Value::str_from(b"text")));
    // A shorter closing run is content.
    let v = parse_all("```x`` ```").unwrap().remove(0);
    assert!(v.equals(&Value::str_from(b"x`` ")));
}

#[test]
fn test_reader_macro_source_position() {
    let values = parse_all("  '(+ 1 2)").unwrap();
    match &values[0] {
        Value::Tuple(t) => {
            // The wrapper carries the quote character's position.
            assert_eq!(t.sm_line, 1);
            assert_eq!(t.sm_column, 3);
            match &t.items[1] {
                Value::Tuple(inner) => {
                    assert_eq!(inner.sm_line, 1);
                    assert_eq!(inner.sm_column, 4);
                }
                other => panic!("expected inner tuple, got {}", other),
            }
        }
        other => panic!("expected tuple, got {}", other),
    }
}

#[test]
fn test_checkpoint_clone_supports_speculative_input() {
    let mut parser = Parser::new();
    feed(&mut parser, "(outer 1 ");
    let checkpoint = parser.clone();

    // Speculative continuation goes bad
    for &b in b"2))" {
        parser.consume(b).unwrap();
        if parser.status() == Status::Error {
            break;
        }
    }
    assert_eq!(parser.status(), Status::Error);

    // Roll back and continue cleanly from the checkpoint
    let mut parser = checkpoint;
    feed(&mut parser, "2)");
    let values = drain(&mut parser);
    assert_eq!(values.len(), 1);
    match &values[0] {
        Value::Tuple(t) => assert_eq!(t.items.len(), 3),
        other => panic!("expected tuple, got {}", other),
    }
}

#[test]
fn test_eof_makes_parser_dead() {
    let mut parser = Parser::new();
    feed(&mut parser, "42 ");
    parser.eof().unwrap();
    assert_eq!(parser.status(), Status::Dead);
    assert!(parser.has_more());
    assert!(parser.produce().unwrap().equals(&Value::Integer(42)));
    assert!(!parser.has_more());
    assert_eq!(parser.consume(b'x'), Err(ParserUsage::Dead));
    assert_eq!(parser.eof(), Err(ParserUsage::Dead));
}

#[test]
fn test_eof_flushes_trailing_token() {
    let mut parser = Parser::new();
    feed(&mut parser, "123");
    assert!(!parser.has_more());
    parser.eof().unwrap();
    assert!(parser.produce().unwrap().equals(&Value::Integer(123)));
}

#[test]
fn test_error_recovery_flushes_and_continues() {
    let mut parser = Parser::new();
    feed(&mut parser, "(1 2 ");
    parser.consume(b'}').unwrap();
    assert_eq!(parser.status(), Status::Error);
    assert_eq!(parser.error(), Some("mismatched delimiter"));
    // After clearing, the partial form is gone and parsing restarts
    assert_eq!(parser.status(), Status::Root);
    feed(&mut parser, "7 ");
    let values = drain(&mut parser);
    assert_eq!(values.len(), 1);
    assert!(values[0].equals(&Value::Integer(7)));
}

#[test]
fn test_insert_is_rejected_outside_container_and_string() {
    let mut parser = Parser::new();
    feed(&mut parser, "# inside a comment");
    assert_eq!(
        parser.insert(&Value::Integer(1)),
        Err(ParserUsage::CannotInsert)
    );
}

#[test]
fn test_insert_at_root_queues_a_value() {
    let mut parser = Parser::new();
    parser.insert(&Value::Integer(5)).unwrap();
    assert!(parser.has_more());
    assert!(parser.produce().unwrap().equals(&Value::Integer(5)));
}

#[test]
fn test_byte_operation_is_consume() {
    let mut parser = Parser::new();
    parser.byte(b'4').unwrap();
    parser.byte(b'2').unwrap();
    parser.byte(b' ').unwrap();
    assert!(parser.produce().unwrap().equals(&Value::Integer(42)));
}

#[test]
fn test_state_frames_snapshot() {
    let mut parser = Parser::new();
    feed(&mut parser, "@{:k (partial");
    let frames = parser.frames();
    assert_eq!(frames[0].kind, "root");
    assert_eq!(frames[1].kind, "table");
    assert_eq!(frames[2].kind, "tuple");
    assert_eq!(frames[3].kind, "token");
    assert!(frames[3].buffer.as_deref() == Some(b"partial".as_slice()));
    assert_eq!(parser.delimiters(), "{(");
}

#[test]
fn test_nested_reader_macros() {
    let values = parse_all("''x").unwrap();
    match &values[0] {
        Value::Tuple(outer) => {
            assert!(outer.items[0].equals(&Value::symbol("quote")));
            match &outer.items[1] {
                Value::Tuple(inner) => {
                    assert!(inner.items[0].equals(&Value::symbol("quote")));
                    assert!(inner.items[1].equals(&Value::symbol("x")));
                }
                other => panic!("expected inner quote, got {}", other),
            }
        }
        other => panic!("expected quote form, got {}", other),
    }
}

#[test]
fn test_reader_macro_wraps_mutable_container() {
    let values = parse_all("'@[1]").unwrap();
    match &values[0] {
        Value::Tuple(t) => {
            assert!(t.items[0].equals(&Value::symbol("quote")));
            assert!(matches!(t.items[1], Value::Array(_)));
        }
        other => panic!("expected quote form, got {}", other),
    }
}

#[test]
fn test_pending_counts_only_closed_top_level_forms() {
    let mut parser = Parser::new();
    feed(&mut parser, "1 2 (3");
    assert!(parser.has_more());
    let values = drain(&mut parser);
    assert_eq!(values.len(), 2);
    assert_eq!(parser.status(), Status::Pending);
}
