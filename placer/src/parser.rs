// Parser for `.pgd` graph descriptions.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators; blocks nest (device scopes, colocation scopes, frames with
// branches) so the statement list is a `recursive` parser.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::graph::FrameKind;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a graph description. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(lex_result.tokens).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| Rich::custom(e.span, e.message))
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let nl = just(Token::Newline).repeated().ignored();

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let string = select! {
        Token::StringLit(value) = e => StringLit { value, span: e.span() },
    };

    // `(a, b, c)`, possibly empty.
    let ident_list = ident
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let device_attr = just(Token::At).ignore_then(string.clone()).or_not();

    let statements = recursive(|statements| {
        let block = statements
            .clone()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));

        // ── set IDENT = STRING ──

        let set_stmt = just(Token::Set)
            .ignore_then(ident.clone())
            .then_ignore(just(Token::Equals))
            .then(string.clone())
            .map(|(name, value)| StatementKind::Set(SetStmt { name, value }));

        // ── name = Op(inputs) @"device" ──

        let node_stmt = ident
            .clone()
            .then_ignore(just(Token::Equals))
            .then(ident.clone())
            .then(ident_list.clone())
            .then(device_attr.clone())
            .map(|(((name, op), inputs), device)| {
                StatementKind::Node(NodeStmt {
                    name,
                    op,
                    inputs,
                    device,
                })
            });

        // ── name = if|while(inputs) capture(values) @"device" { branch ... } ──

        let frame_kind = just(Token::If)
            .to(FrameKind::Cond)
            .or(just(Token::While).to(FrameKind::While));

        let branch = just(Token::Branch)
            .ignore_then(ident.clone())
            .then(ident_list.clone())
            .then(block.clone())
            .map_with(|((name, params), body), e| Branch {
                name,
                params,
                body,
                span: e.span(),
            });

        let branches = nl
            .clone()
            .ignore_then(
                branch
                    .separated_by(just(Token::Newline).repeated().at_least(1))
                    .allow_trailing()
                    .collect::<Vec<_>>(),
            )
            .then_ignore(nl.clone())
            .delimited_by(just(Token::LBrace), just(Token::RBrace));

        let frame_stmt = ident
            .clone()
            .then_ignore(just(Token::Equals))
            .then(frame_kind)
            .then(ident_list.clone())
            .then(just(Token::Capture).ignore_then(ident_list.clone()).or_not())
            .then(device_attr.clone())
            .then(branches)
            .map(|(((((name, kind), inputs), captures), device), branches)| {
                StatementKind::Frame(FrameStmt {
                    name,
                    kind,
                    inputs,
                    captures: captures.unwrap_or_default(),
                    device,
                    branches,
                })
            });

        // ── Scopes and directives ──

        let device_scope = just(Token::Device)
            .ignore_then(string.clone())
            .then(block.clone())
            .map(|(device, body)| StatementKind::DeviceScope(DeviceScope { device, body }));

        let colocate_scope = just(Token::ColocateWith)
            .ignore_then(ident.clone())
            .then(block)
            .map(|(target, body)| StatementKind::ColocateScope(ColocateScope { target, body }));

        let colocate = just(Token::Colocate)
            .ignore_then(
                ident
                    .clone()
                    .separated_by(just(Token::Comma))
                    .at_least(2)
                    .collect::<Vec<_>>(),
            )
            .map(|nodes| StatementKind::Colocate(ColocateStmt { nodes }));

        let return_stmt = just(Token::Return)
            .ignore_then(
                ident
                    .clone()
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map(|values| StatementKind::Return(ReturnStmt { values }));

        // ── Statement dispatch ──

        let statement = choice((
            set_stmt,
            device_scope,
            colocate_scope,
            colocate,
            return_stmt,
            frame_stmt,
            node_stmt,
        ))
        .map_with(|kind, e| Statement {
            kind,
            span: e.span(),
        });

        nl.clone()
            .ignore_then(
                statement
                    .separated_by(just(Token::Newline).repeated().at_least(1))
                    .allow_trailing()
                    .collect::<Vec<_>>(),
            )
            .then_ignore(nl.clone())
    });

    // ── Program ──

    statements.map_with(|statements, e| Program {
        statements,
        span: e.span(),
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.program.expect("expected program")
    }

    fn parse_one_stmt(source: &str) -> Statement {
        let prog = parse_ok(source);
        assert_eq!(prog.statements.len(), 1, "expected 1 statement");
        prog.statements.into_iter().next().unwrap()
    }

    #[test]
    fn empty_program() {
        assert!(parse_ok("").statements.is_empty());
        assert!(parse_ok("\n\n# only a comment\n").statements.is_empty());
    }

    #[test]
    fn set_stmt() {
        let stmt = parse_one_stmt(r#"set default_device = "/cpu:0""#);
        match stmt.kind {
            StatementKind::Set(set) => {
                assert_eq!(set.name.name, "default_device");
                assert_eq!(set.value.value, "/cpu:0");
            }
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn node_without_inputs() {
        let stmt = parse_one_stmt("ds = RangeDataset()");
        match stmt.kind {
            StatementKind::Node(node) => {
                assert_eq!(node.name.name, "ds");
                assert_eq!(node.op.name, "RangeDataset");
                assert!(node.inputs.is_empty());
                assert!(node.device.is_none());
            }
            other => panic!("expected node, got {other:?}"),
        }
    }

    #[test]
    fn node_with_inputs_and_device() {
        let stmt = parse_one_stmt(r#"s = Add(a, b) @"/gpu:1""#);
        match stmt.kind {
            StatementKind::Node(node) => {
                let inputs: Vec<&str> = node.inputs.iter().map(|i| i.name.as_str()).collect();
                assert_eq!(inputs, vec!["a", "b"]);
                assert_eq!(node.device.unwrap().value, "/gpu:1");
            }
            other => panic!("expected node, got {other:?}"),
        }
    }

    #[test]
    fn cond_with_captures_and_branches() {
        let src = r#"
out = if(pred) capture(ds) @"/cpu:0" {
  branch then(d) {
    m = MapDataset(d)
    return m
  }

  branch else(d) {
    return d
  }
}
"#;
        let stmt = parse_one_stmt(src);
        match stmt.kind {
            StatementKind::Frame(frame) => {
                assert_eq!(frame.kind, FrameKind::Cond);
                assert_eq!(frame.inputs.len(), 1);
                assert_eq!(frame.captures[0].name, "ds");
                assert_eq!(frame.device.unwrap().value, "/cpu:0");
                assert_eq!(frame.branches.len(), 2);
                assert_eq!(frame.branches[0].name.name, "then");
                assert_eq!(frame.branches[0].body.len(), 2);
                assert!(matches!(
                    frame.branches[1].body[0].kind,
                    StatementKind::Return(_)
                ));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn while_without_capture() {
        let stmt = parse_one_stmt("l = while(n) {\n  branch body() {\n  }\n}");
        match stmt.kind {
            StatementKind::Frame(frame) => {
                assert_eq!(frame.kind, FrameKind::While);
                assert!(frame.captures.is_empty());
                assert!(frame.branches[0].body.is_empty());
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn nested_scopes() {
        let src = r#"device "/job:w" {
  colocate_with ds {
    it = AnonymousIterator(ds)
  }
}"#;
        let stmt = parse_one_stmt(src);
        let StatementKind::DeviceScope(scope) = stmt.kind else {
            panic!("expected device scope");
        };
        assert_eq!(scope.device.value, "/job:w");
        let StatementKind::ColocateScope(inner) = &scope.body[0].kind else {
            panic!("expected colocate scope");
        };
        assert_eq!(inner.target.name, "ds");
        assert_eq!(inner.body.len(), 1);
    }

    #[test]
    fn colocate_needs_two_names() {
        let stmt = parse_one_stmt("colocate a, b, c");
        let StatementKind::Colocate(c) = stmt.kind else {
            panic!("expected colocate");
        };
        assert_eq!(c.nodes.len(), 3);
        assert!(!parse("colocate a").errors.is_empty());
    }

    #[test]
    fn statements_need_newlines() {
        let result = parse("a = Const() b = Const()");
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn missing_equals_is_error() {
        let result = parse("a Const()");
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn lex_errors_are_merged() {
        let result = parse("a = Const() $\n");
        assert!(result
            .errors
            .iter()
            .any(|e| e.to_string().contains("unexpected character")));
    }

    #[test]
    fn spans_cover_statement() {
        let prog = parse_ok("\nab = Const()\n");
        assert_eq!(prog.statements[0].span.start, 1);
        assert_eq!(prog.statements[0].span.end, 12);
    }
}
