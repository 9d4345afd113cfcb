use serde_json::Value;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::opt;
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, take_while};
use winnow::{ModalResult, Parser};

use stepchain_types::ChainError;

use crate::ast::*;

/// Root names an expression may refer to.
pub(crate) const ROOT_NAMES: &[&str] = &["ctx", "results", "outputs"];

/// Filters the evaluator knows about.
pub(crate) const FILTER_NAMES: &[&str] = &[
    "abs",
    "bool",
    "default",
    "float",
    "int",
    "keys",
    "length",
    "round",
    "string",
    "to_ctx",
    "to_results",
];

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn make_label_error(label: &'static str) -> ErrMode<ContextError> {
    let mut e = ContextError::new();
    e.push(StrContext::Label(label));
    ErrMode::Cut(e)
}

/// Whitespace consumer (including newlines).
fn ws(input: &mut &str) -> ModalResult<()> {
    multispace0.void().parse_next(input)
}

fn digits<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    digit1.parse_next(input)
}

fn next_char(input: &mut &str) -> ModalResult<char> {
    any.parse_next(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, is_ident_start),
        take_while(0.., is_ident_continue),
    )
        .take()
        .parse_next(input)
}

/// Consume `token` if the input starts with it.
fn eat<'i>(input: &mut &'i str, token: &str) -> bool {
    let current: &'i str = *input;
    match current.strip_prefix(token) {
        Some(rest) => {
            *input = rest;
            true
        }
        None => false,
    }
}

/// Consume the keyword `kw` if it is not immediately followed by an
/// identifier character (`or` must not match the start of `order`).
fn eat_keyword<'i>(input: &mut &'i str, kw: &str) -> bool {
    let current: &'i str = *input;
    match current.strip_prefix(kw) {
        Some(rest) if !rest.starts_with(is_ident_continue) => {
            *input = rest;
            true
        }
        _ => false,
    }
}

fn eat_not_in<'i>(input: &mut &'i str) -> bool {
    let checkpoint: &'i str = *input;
    if eat_keyword(input, "not") {
        let rest: &'i str = *input;
        *input = rest.trim_start();
        if eat_keyword(input, "in") {
            return true;
        }
    }
    *input = checkpoint;
    false
}

/// Run `parser` and turn a backtrack into a hard error describing what was expected.
fn required(
    input: &mut &str,
    parser: fn(&mut &str) -> ModalResult<Expr>,
    desc: &'static str,
) -> ModalResult<Expr> {
    parser(input).map_err(|e| match e {
        ErrMode::Backtrack(_) => make_cut_error(desc),
        other => other,
    })
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

/// Parse a quoted string (single or double quotes) with escape support.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let quote = next_char(input)?;
    if quote != '"' && quote != '\'' {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    let mut s = String::new();
    loop {
        let c = next_char(input).map_err(|_| make_cut_error("closing quote"))?;
        match c {
            '\\' => {
                let esc = next_char(input).map_err(|_| make_cut_error("escape sequence"))?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    '\'' => s.push('\''),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            c if c == quote => break,
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Parse an integer or a float (`digits '.' digits`). Signs are unary operators.
fn number<'i>(input: &mut &'i str) -> ModalResult<Expr> {
    let int_part: &'i str = digits(input)?;
    let checkpoint: &'i str = *input;
    if eat(input, ".") {
        if let Some(frac) = opt(digits).parse_next(input)? {
            let text = format!("{int_part}.{frac}");
            let f: f64 = text.parse().map_err(|_| make_cut_error("number"))?;
            let n = serde_json::Number::from_f64(f).ok_or_else(|| make_cut_error("finite number"))?;
            return Ok(Expr::Literal(Value::Number(n)));
        }
        *input = checkpoint;
    }
    let i: i64 = int_part
        .parse()
        .map_err(|_| make_cut_error("integer within 64-bit range"))?;
    Ok(Expr::Literal(Value::from(i)))
}

/// Parse comma separated expressions up to (and including) `close`.
fn arguments(input: &mut &str, close: &str, desc: &'static str) -> ModalResult<Vec<Expr>> {
    let mut items = Vec::new();
    ws(input)?;
    if eat(input, close) {
        return Ok(items);
    }
    loop {
        let item = required(input, expression, "expression")?;
        items.push(item);
        ws(input)?;
        if eat(input, ",") {
            ws(input)?;
            if eat(input, close) {
                break;
            }
            continue;
        }
        if eat(input, close) {
            break;
        }
        return Err(make_cut_error(desc));
    }
    Ok(items)
}

/// Parse `{ key: value, ... }` after the opening brace.
fn map_literal(input: &mut &str) -> ModalResult<Expr> {
    let mut entries = Vec::new();
    ws(input)?;
    if eat(input, "}") {
        return Ok(Expr::Map(entries));
    }
    loop {
        ws(input)?;
        let key = if input.starts_with('"') || input.starts_with('\'') {
            quoted_string(input)?
        } else {
            identifier(input)
                .map_err(|_| make_cut_error("mapping key"))?
                .to_string()
        };
        ws(input)?;
        if !eat(input, ":") {
            return Err(make_cut_error("':' after mapping key"));
        }
        let value = required(input, expression, "mapping value")?;
        entries.push((key, value));
        ws(input)?;
        if eat(input, ",") {
            ws(input)?;
            if eat(input, "}") {
                break;
            }
            continue;
        }
        if eat(input, "}") {
            break;
        }
        return Err(make_cut_error("',' or '}'"));
    }
    Ok(Expr::Map(entries))
}

fn primary(input: &mut &str) -> ModalResult<Expr> {
    ws(input)?;
    if eat(input, "(") {
        let inner = required(input, expression, "expression after '('")?;
        ws(input)?;
        if !eat(input, ")") {
            return Err(make_cut_error("')'"));
        }
        return Ok(inner);
    }
    if eat(input, "[") {
        return arguments(input, "]", "',' or ']'").map(Expr::List);
    }
    if eat(input, "{") {
        return map_literal(input);
    }
    if input.starts_with('"') || input.starts_with('\'') {
        return quoted_string(input).map(|s| Expr::Literal(Value::String(s)));
    }
    if input.starts_with(|c: char| c.is_ascii_digit()) {
        return number(input);
    }
    if let Some(name) = opt(identifier).parse_next(input)? {
        return match name {
            "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
            "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
            "none" | "None" | "null" => Ok(Expr::Literal(Value::Null)),
            name if ROOT_NAMES.contains(&name) => Ok(Expr::Name(name.to_string())),
            _ => Err(make_label_error("unknown name (expected ctx, results or outputs)")),
        };
    }
    Err(ErrMode::Backtrack(ContextError::new()))
}

/// Member access and indexing: `a.b`, `a.0`, `a[expr]`.
fn postfix(input: &mut &str) -> ModalResult<Expr> {
    let mut expr = primary(input)?;
    loop {
        if eat(input, ".") {
            let key = match opt(identifier).parse_next(input)? {
                Some(id) => id,
                None => digits(input).map_err(|_| make_cut_error("attribute name after '.'"))?,
            };
            expr = Expr::Attr(Box::new(expr), key.to_string());
        } else if eat(input, "[") {
            let index = required(input, expression, "index expression")?;
            ws(input)?;
            if !eat(input, "]") {
                return Err(make_cut_error("']'"));
            }
            expr = Expr::Index(Box::new(expr), Box::new(index));
        } else {
            break;
        }
    }
    Ok(expr)
}

/// Filter application: `expr | name` or `expr | name(args)`.
fn filtered(input: &mut &str) -> ModalResult<Expr> {
    let mut expr = postfix(input)?;
    loop {
        ws(input)?;
        if !eat(input, "|") {
            break;
        }
        ws(input)?;
        let name = identifier(input).map_err(|_| make_cut_error("filter name after '|'"))?;
        if !FILTER_NAMES.contains(&name) {
            return Err(make_label_error("unknown filter"));
        }
        let args = if eat(input, "(") {
            arguments(input, ")", "',' or ')'")?
        } else {
            Vec::new()
        };
        expr = Expr::Filter {
            input: Box::new(expr),
            name: name.to_string(),
            args,
        };
    }
    Ok(expr)
}

fn unary(input: &mut &str) -> ModalResult<Expr> {
    ws(input)?;
    if eat(input, "-") {
        let inner = required(input, unary, "operand after '-'")?;
        return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
    }
    filtered(input)
}

fn multiplicative(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = unary(input)?;
    loop {
        ws(input)?;
        let op = if eat(input, "*") {
            BinaryOp::Mul
        } else if eat(input, "//") {
            BinaryOp::FloorDiv
        } else if eat(input, "/") {
            BinaryOp::Div
        } else if eat(input, "%") {
            BinaryOp::Mod
        } else {
            break;
        };
        let rhs = required(input, unary, "right-hand operand")?;
        lhs = binary(op, lhs, rhs);
    }
    Ok(lhs)
}

fn additive(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = multiplicative(input)?;
    loop {
        ws(input)?;
        let op = if eat(input, "+") {
            BinaryOp::Add
        } else if eat(input, "-") {
            BinaryOp::Sub
        } else {
            break;
        };
        let rhs = required(input, multiplicative, "right-hand operand")?;
        lhs = binary(op, lhs, rhs);
    }
    Ok(lhs)
}

fn concat(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = additive(input)?;
    loop {
        ws(input)?;
        if !eat(input, "~") {
            break;
        }
        let rhs = required(input, additive, "right-hand operand of '~'")?;
        lhs = binary(BinaryOp::Concat, lhs, rhs);
    }
    Ok(lhs)
}

fn comparison(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = concat(input)?;
    loop {
        ws(input)?;
        let op = if eat(input, "==") {
            BinaryOp::Eq
        } else if eat(input, "!=") {
            BinaryOp::NotEq
        } else if eat(input, "<=") {
            BinaryOp::LtEq
        } else if eat(input, ">=") {
            BinaryOp::GtEq
        } else if eat(input, "<") {
            BinaryOp::Lt
        } else if eat(input, ">") {
            BinaryOp::Gt
        } else if eat_keyword(input, "in") {
            BinaryOp::In
        } else if eat_not_in(input) {
            BinaryOp::NotIn
        } else {
            break;
        };
        let rhs = required(input, concat, "right-hand operand of comparison")?;
        lhs = binary(op, lhs, rhs);
    }
    Ok(lhs)
}

fn not_expr(input: &mut &str) -> ModalResult<Expr> {
    ws(input)?;
    if eat_keyword(input, "not") {
        let inner = required(input, not_expr, "expression after 'not'")?;
        return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
    }
    comparison(input)
}

fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = not_expr(input)?;
    loop {
        ws(input)?;
        if !eat_keyword(input, "and") {
            break;
        }
        let rhs = required(input, not_expr, "expression after 'and'")?;
        lhs = binary(BinaryOp::And, lhs, rhs);
    }
    Ok(lhs)
}

fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = and_expr(input)?;
    loop {
        ws(input)?;
        if !eat_keyword(input, "or") {
            break;
        }
        let rhs = required(input, and_expr, "expression after 'or'")?;
        lhs = binary(BinaryOp::Or, lhs, rhs);
    }
    Ok(lhs)
}

fn expression(input: &mut &str) -> ModalResult<Expr> {
    or_expr(input)
}

/// An expression that must consume the whole input.
fn complete_expression(input: &mut &str) -> ModalResult<Expr> {
    ws(input)?;
    let expr = required(input, expression, "expression")?;
    ws(input)?;
    if !input.is_empty() {
        return Err(make_cut_error("end of expression"));
    }
    Ok(expr)
}

fn error_message(e: ErrMode<ContextError>) -> String {
    let message = match e {
        ErrMode::Backtrack(c) | ErrMode::Cut(c) => c.to_string(),
        ErrMode::Incomplete(_) => String::new(),
    };
    if message.is_empty() {
        "unexpected input".to_string()
    } else {
        message
    }
}

fn syntax_error(source: &str, col: usize, message: String) -> ChainError {
    ChainError::ExpressionSyntax {
        expression: source.to_string(),
        col,
        message,
    }
}

/// Strip one outer `{{ ... }}` wrapper, if present.
pub(crate) fn unwrap_delimiters(source: &str) -> (&str, usize) {
    let leading = source.len() - source.trim_start().len();
    let trimmed = source.trim();
    match trimmed
        .strip_prefix("{{")
        .and_then(|inner| inner.strip_suffix("}}"))
    {
        Some(inner) => (inner, leading + 2),
        None => (trimmed, leading),
    }
}

/// Parse a single expression, optionally wrapped in `{{ }}`.
pub fn parse_expression(source: &str) -> Result<Expr, ChainError> {
    let (body, offset) = unwrap_delimiters(source);
    let mut remaining = body;
    complete_expression(&mut remaining).map_err(|e| {
        let col = offset + body.len() - remaining.len() + 1;
        syntax_error(source, col, error_message(e))
    })
}

/// Find the `}}` closing a template segment, skipping quoted strings.
fn find_closing(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Split a template string into text and `{{ expression }}` segments.
pub fn parse_template(source: &str) -> Result<Vec<Segment>, ChainError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut consumed = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = find_closing(after).ok_or_else(|| {
            syntax_error(source, consumed + start + 1, "unterminated '{{'".to_string())
        })?;
        let body = &after[..end];
        let mut remaining = body;
        let expr = complete_expression(&mut remaining).map_err(|e| {
            let col = consumed + start + 2 + body.len() - remaining.len() + 1;
            syntax_error(source, col, error_message(e))
        })?;
        segments.push(Segment::Expr(expr));

        let advance = start + 2 + end + 2;
        consumed += advance;
        rest = &rest[advance..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}
