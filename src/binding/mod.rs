use std::borrow::Cow;

mod scanner;

use scanner::{
    State, is_block_comment_end, is_block_comment_start, is_dash_comment_start, step_quoted,
};

use crate::error::SqlPipesError;
use crate::types::RowValues;

/// Byte offsets of every `?` placeholder in `sql`.
///
/// Question marks inside quoted strings, backtick identifiers and comments are not
/// placeholders.
#[must_use]
pub fn placeholder_positions(sql: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    scan(sql, |idx| positions.push(idx));
    positions
}

/// Splice `bindings` into `sql`, replacing the k-th `?` with the k-th binding rendered as a
/// literal. Strings are quoted and passed through `escape`.
///
/// With no bindings the statement is returned untouched.
///
/// ```rust
/// use sql_pipes::binding::bind_placeholders;
/// use sql_pipes::driver::escape_string;
/// use sql_pipes::prelude::*;
///
/// let sql = bind_placeholders(
///     "select * from users where name = ? and age > ?",
///     &[RowValues::Text("wang'wu".into()), RowValues::Int(3)],
///     &escape_string,
/// )?;
/// assert_eq!(sql, "select * from users where name = 'wang\\'wu' and age > 3");
/// # Ok::<(), SqlPipesError>(())
/// ```
///
/// # Errors
/// Returns [`SqlPipesError::InvalidArgument`] when the number of placeholders differs from the
/// number of bindings, or when a binding has no literal form.
pub fn bind_placeholders<'a>(
    sql: &'a str,
    bindings: &[RowValues],
    escape: &dyn Fn(&str) -> String,
) -> Result<Cow<'a, str>, SqlPipesError> {
    if bindings.is_empty() {
        return Ok(Cow::Borrowed(sql));
    }

    let positions = placeholder_positions(sql);
    if positions.len() != bindings.len() {
        return Err(SqlPipesError::InvalidArgument(format!(
            "statement has {} placeholder(s) but {} binding(s) were given",
            positions.len(),
            bindings.len()
        )));
    }

    let mut out = String::with_capacity(sql.len() + bindings.len() * 8);
    let mut last = 0;
    for (idx, value) in positions.iter().zip(bindings) {
        out.push_str(&sql[last..*idx]);
        out.push_str(&value.to_sql_literal(escape)?);
        last = idx + 1;
    }
    out.push_str(&sql[last..]);
    Ok(Cow::Owned(out))
}

fn scan(sql: &str, mut on_placeholder: impl FnMut(usize)) {
    let bytes = sql.as_bytes();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'?' => on_placeholder(idx),
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backtick,
                b'#' => state = State::LineComment,
                _ if is_dash_comment_start(bytes, idx) => {
                    state = State::LineComment;
                    idx += 1;
                }
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment;
                    idx += 1;
                }
                _ => {}
            },
            State::SingleQuoted | State::DoubleQuoted | State::Backtick => {
                let (quote, backslash) = match state {
                    State::SingleQuoted => (b'\'', true),
                    State::DoubleQuoted => (b'"', true),
                    _ => (b'`', false),
                };
                let (next, closed) = step_quoted(bytes, idx, quote, backslash);
                idx = next;
                if closed {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if is_block_comment_end(bytes, idx) {
                    state = State::Normal;
                    idx += 1;
                }
            }
        }
        idx += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::escape_string;

    #[test]
    fn replaces_placeholders_in_order() {
        let sql = "update users set name = ?, age = ? where id = ?";
        let res = bind_placeholders(
            sql,
            &[RowValues::Text("foo".into()), RowValues::Int(10), RowValues::Int(1)],
            &escape_string,
        )
        .unwrap();
        assert_eq!(res, "update users set name = 'foo', age = 10 where id = 1");
        assert!(placeholder_positions(&res).is_empty());
    }

    #[test]
    fn bound_question_marks_are_not_rebound() {
        let res = bind_placeholders(
            "select * from users where name = ? and age = ?",
            &[RowValues::Text("xihai?".into()), RowValues::Int(13)],
            &escape_string,
        )
        .unwrap();
        assert_eq!(res, "select * from users where name = 'xihai?' and age = 13");
    }

    #[test]
    fn quotes_are_escaped() {
        let res = bind_placeholders(
            "select * from users where name = ?",
            &[RowValues::Text("wang'wu".into())],
            &escape_string,
        )
        .unwrap();
        assert_eq!(res, "select * from users where name = 'wang\\'wu'");
    }

    #[test]
    fn null_binding() {
        let res = bind_placeholders("insert into t values (?)", &[RowValues::Null], &escape_string)
            .unwrap();
        assert_eq!(res, "insert into t values (null)");
    }

    #[test]
    fn skips_literals_identifiers_and_comments() {
        let sql = "select '?', \"it\\\"s ?\", `a?` -- ?\n# ?\n/* ? */ from t where a = ?";
        assert_eq!(placeholder_positions(sql).len(), 1);
        let res = bind_placeholders(sql, &[RowValues::Int(7)], &escape_string).unwrap();
        assert!(res.ends_with("where a = 7"));
    }

    #[test]
    fn double_dash_without_space_is_not_a_comment() {
        assert_eq!(placeholder_positions("select 1--? ").len(), 1);
    }

    #[test]
    fn multibyte_text_survives() {
        let res = bind_placeholders("select '王五', ?", &[RowValues::Text("李四".into())], &escape_string)
            .unwrap();
        assert_eq!(res, "select '王五', '李四'");
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let err = bind_placeholders("select ?, ?", &[RowValues::Int(1)], &escape_string)
            .unwrap_err();
        assert!(matches!(err, SqlPipesError::InvalidArgument(_)));
        let err = bind_placeholders("select 1", &[RowValues::Int(1)], &escape_string).unwrap_err();
        assert!(matches!(err, SqlPipesError::InvalidArgument(_)));
    }

    #[test]
    fn no_bindings_borrows() {
        let res = bind_placeholders("select ?", &[], &escape_string).unwrap();
        assert!(matches!(res, Cow::Borrowed(_)));
    }
}
