//! Plan-script parser.
//!
//! Statements carry their 1-based source line so runtime errors can point
//! back into the script. Keywords after which the grammar is unambiguous are
//! followed by `cut`, so errors inside blocks report the innermost position.
//!
//! Parentheses, unary operators, operator chains and blocks all count
//! towards one nesting depth. Past `MAX_NESTING` the parse fails, so the
//! tree handed to the interpreter is never deep enough to exhaust the stack.

use std::cell::Cell;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace1, not_line_ending, satisfy},
    combinator::{all_consuming, cut, map, not, opt, recognize, value},
    error::{context, ContextError, ErrorKind, ParseError, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::ast::{BinOp, Expr, Stmt, StmtKind, UnOp};
use crate::error::ScriptError;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

pub const MAX_NESTING: usize = 64;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One open nesting level; dropping it closes the level.
struct Nesting;

impl Nesting {
    fn enter(i: &str) -> Result<Nesting, nom::Err<VerboseError<&str>>> {
        let depth = DEPTH.with(|d| {
            d.set(d.get() + 1);
            d.get()
        });
        let level = Nesting;
        if depth > MAX_NESTING {
            return Err(nom::Err::Failure(VerboseError::from_error_kind(i, ErrorKind::TooLarge)));
        }
        Ok(level)
    }
}

impl Drop for Nesting {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

fn nested<'a, O, F>(mut inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    move |i| {
        let _level = Nesting::enter(i)?;
        inner(i)
    }
}

const KEYWORDS: &[&str] = &[
    "let", "if", "else", "while", "for", "in", "break", "continue", "true", "false", "none", "and", "or", "not",
];

/// Parse a whole script.
pub fn parse_script(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    match all_consuming(terminated(many0(|i| statement(i, src)), sp))(src) {
        Ok((_, stmts)) => Ok(stmts),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(describe(src, e)),
        Err(nom::Err::Incomplete(_)) => Err(ScriptError::Parse { line: 1, message: "incomplete input".into() }),
    }
}

fn line_of(src: &str, rest: &str) -> usize {
    let offset = src.len().saturating_sub(rest.len());
    src[..offset].matches('\n').count() + 1
}

fn describe(src: &str, e: VerboseError<&str>) -> ScriptError {
    let Some((at, first)) = e.errors.first() else {
        return ScriptError::Parse { line: 1, message: "syntax error".into() };
    };
    let expected = match first {
        VerboseErrorKind::Nom(ErrorKind::TooLarge) => Some(format!("nesting deeper than {} levels", MAX_NESTING)),
        _ => e.errors.iter().find_map(|(_, k)| match k {
            VerboseErrorKind::Context(c) => Some(format!("expected {}", c)),
            _ => None,
        }),
    };
    let expected = expected.unwrap_or_else(|| match first {
        VerboseErrorKind::Char(c) => format!("expected '{}'", c),
        _ => "unexpected input".to_string(),
    });
    let near: String = at.trim_start().lines().next().unwrap_or("").chars().take(24).collect();
    let message = if near.is_empty() {
        format!("{} at end of script", expected)
    } else {
        format!("{} near `{}`", expected, near)
    };
    ScriptError::Parse { line: line_of(src, at.trim_start()), message }
}

// ---- lexical ----

fn comment(i: &str) -> PResult<&str> {
    recognize(pair(char('#'), not_line_ending))(i)
}

/// Whitespace and comments.
fn sp(i: &str) -> PResult<()> {
    value((), many0(alt((multispace1, comment))))(i)
}

fn lex<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    preceded(sp, inner)
}

fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    lex(tag(s))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    lex(terminated(tag(kw), not(satisfy(is_ident_char))))
}

fn ident(i: &str) -> PResult<String> {
    let (rest, name) = lex(recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    )))(i)?;
    if KEYWORDS.contains(&name) {
        return Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Tag)));
    }
    Ok((rest, name.to_string()))
}

fn number(i: &str) -> PResult<f64> {
    let (rest, text) = lex(recognize(pair(digit1, opt(pair(char('.'), digit1)))))(i)?;
    match text.parse::<f64>() {
        Ok(n) => Ok((rest, n)),
        Err(_) => Err(nom::Err::Error(VerboseError::from_error_kind(i, ErrorKind::Float))),
    }
}

fn string_lit(i: &str) -> PResult<String> {
    let (body, quote) = lex(alt((char('"'), char('\''))))(i)?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((&body[idx + c.len_utf8()..], out)),
            '\n' => break,
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(nom::Err::Failure(VerboseError::add_context(
        i,
        "closing quote",
        VerboseError::from_error_kind(i, ErrorKind::Char),
    )))
}

// ---- expressions ----

fn expr(i: &str) -> PResult<Expr> {
    or_expr(i)
}

fn or_expr(i: &str) -> PResult<Expr> {
    let (mut i, mut lhs) = and_expr(i)?;
    let mut held = Vec::new();
    while let Ok((rest, _)) = alt((keyword("or"), sym("||")))(i) {
        held.push(Nesting::enter(rest)?);
        let (rest, rhs) = cut(and_expr)(rest)?;
        lhs = Expr::binary(BinOp::Or, lhs, rhs);
        i = rest;
    }
    Ok((i, lhs))
}

fn and_expr(i: &str) -> PResult<Expr> {
    let (mut i, mut lhs) = not_expr(i)?;
    let mut held = Vec::new();
    while let Ok((rest, _)) = alt((keyword("and"), sym("&&")))(i) {
        held.push(Nesting::enter(rest)?);
        let (rest, rhs) = cut(not_expr)(rest)?;
        lhs = Expr::binary(BinOp::And, lhs, rhs);
        i = rest;
    }
    Ok((i, lhs))
}

fn not_expr(i: &str) -> PResult<Expr> {
    alt((
        map(preceded(alt((keyword("not"), lex(terminated(tag("!"), not(char('=')))))), cut(nested(not_expr))), |e| {
            Expr::Unary(UnOp::Not, Box::new(e))
        }),
        cmp_expr,
    ))(i)
}

fn cmp_op(i: &str) -> PResult<BinOp> {
    alt((
        value(BinOp::Eq, sym("==")),
        value(BinOp::Ne, sym("!=")),
        value(BinOp::Le, sym("<=")),
        value(BinOp::Ge, sym(">=")),
        value(BinOp::Lt, sym("<")),
        value(BinOp::Gt, sym(">")),
    ))(i)
}

fn cmp_expr(i: &str) -> PResult<Expr> {
    let (i, lhs) = sum_expr(i)?;
    match cmp_op(i) {
        Ok((rest, op)) => {
            let (rest, rhs) = cut(sum_expr)(rest)?;
            Ok((rest, Expr::binary(op, lhs, rhs)))
        }
        Err(_) => Ok((i, lhs)),
    }
}

fn sum_expr(i: &str) -> PResult<Expr> {
    let (mut i, mut lhs) = term_expr(i)?;
    let mut held = Vec::new();
    while let Ok((rest, op)) = alt((value(BinOp::Add, sym("+")), value(BinOp::Sub, sym("-"))))(i) {
        held.push(Nesting::enter(rest)?);
        let (rest, rhs) = cut(term_expr)(rest)?;
        lhs = Expr::binary(op, lhs, rhs);
        i = rest;
    }
    Ok((i, lhs))
}

fn term_expr(i: &str) -> PResult<Expr> {
    let (mut i, mut lhs) = unary_expr(i)?;
    let mut held = Vec::new();
    while let Ok((rest, op)) = alt((
        value(BinOp::Mul, sym("*")),
        value(BinOp::Div, sym("/")),
        value(BinOp::Rem, sym("%")),
    ))(i)
    {
        held.push(Nesting::enter(rest)?);
        let (rest, rhs) = cut(unary_expr)(rest)?;
        lhs = Expr::binary(op, lhs, rhs);
        i = rest;
    }
    Ok((i, lhs))
}

fn unary_expr(i: &str) -> PResult<Expr> {
    alt((
        map(preceded(sym("-"), cut(nested(unary_expr))), |e| Expr::Unary(UnOp::Neg, Box::new(e))),
        postfix_expr,
    ))(i)
}

fn postfix_expr(i: &str) -> PResult<Expr> {
    let (mut i, mut e) = primary(i)?;
    let mut held = Vec::new();
    // a single '.' is field access; '..' belongs to a range
    while let Ok((rest, _)) = lex(terminated(char('.'), not(char('.'))))(i) {
        held.push(Nesting::enter(rest)?);
        let (rest, field) = cut(context("field name", ident))(rest)?;
        e = Expr::Field(Box::new(e), field);
        i = rest;
    }
    Ok((i, e))
}

fn call_args(i: &str) -> PResult<Vec<Expr>> {
    preceded(
        sym("("),
        cut(terminated(separated_list0(sym(","), nested(expr)), context("')'", sym(")")))),
    )(i)
}

fn primary(i: &str) -> PResult<Expr> {
    alt((
        map(number, Expr::Number),
        map(string_lit, Expr::Str),
        value(Expr::Bool(true), keyword("true")),
        value(Expr::Bool(false), keyword("false")),
        value(Expr::None, keyword("none")),
        delimited(sym("("), cut(nested(expr)), cut(context("')'", sym(")")))),
        map(pair(ident, opt(call_args)), |(name, args)| match args {
            Some(args) => Expr::Call { name, args },
            None => Expr::Var(name),
        }),
    ))(i)
}

// ---- statements ----

fn block<'a>(i: &'a str, src: &'a str) -> PResult<'a, Vec<Stmt>> {
    let _level = Nesting::enter(i)?;
    preceded(
        context("'{'", sym("{")),
        cut(terminated(many0(|i| statement(i, src)), context("'}'", sym("}")))),
    )(i)
}

fn if_stmt<'a>(i: &'a str, src: &'a str) -> PResult<'a, StmtKind> {
    let (i, _) = keyword("if")(i)?;
    let (i, first) = cut(pair(context("condition", expr), |i| block(i, src)))(i)?;
    let (i, more) = many0(preceded(
        pair(keyword("else"), keyword("if")),
        cut(pair(context("condition", expr), |i| block(i, src))),
    ))(i)?;
    let (i, otherwise) = opt(preceded(keyword("else"), cut(|i| block(i, src))))(i)?;
    let mut branches = vec![first];
    branches.extend(more);
    Ok((i, StmtKind::If { branches, otherwise }))
}

fn while_stmt<'a>(i: &'a str, src: &'a str) -> PResult<'a, StmtKind> {
    let (i, _) = keyword("while")(i)?;
    let (i, (cond, body)) = cut(pair(context("condition", expr), |i| block(i, src)))(i)?;
    Ok((i, StmtKind::While { cond, body }))
}

fn for_stmt<'a>(i: &'a str, src: &'a str) -> PResult<'a, StmtKind> {
    let (i, _) = keyword("for")(i)?;
    let (i, (var, _, from, _, to, body)) = cut(tuple((
        context("loop variable", ident),
        context("'in'", keyword("in")),
        expr,
        context("'..'", sym("..")),
        expr,
        |i| block(i, src),
    )))(i)?;
    Ok((i, StmtKind::For { var, from, to, body }))
}

fn let_stmt(i: &str) -> PResult<StmtKind> {
    let (i, _) = keyword("let")(i)?;
    let (i, (name, _, value)) = cut(tuple((context("variable name", ident), context("'='", sym("=")), expr)))(i)?;
    Ok((i, StmtKind::Let { name, value }))
}

fn assign_stmt(i: &str) -> PResult<StmtKind> {
    let (i, name) = ident(i)?;
    let (i, _) = lex(terminated(char('='), not(char('='))))(i)?;
    let (i, value) = cut(expr)(i)?;
    Ok((i, StmtKind::Assign { name, value }))
}

fn statement<'a>(i: &'a str, src: &'a str) -> PResult<'a, Stmt> {
    let (i, _) = sp(i)?;
    let line = line_of(src, i);
    let (i, kind) = alt((
        |i| if_stmt(i, src),
        |i| while_stmt(i, src),
        |i| for_stmt(i, src),
        let_stmt,
        value(StmtKind::Break, keyword("break")),
        value(StmtKind::Continue, keyword("continue")),
        assign_stmt,
        map(expr, StmtKind::Expr),
    ))(i)?;
    let (i, _) = opt(sym(";"))(i)?;
    Ok((i, Stmt { line, kind }))
}
