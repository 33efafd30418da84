//! Identifier delimiting and literal rendering for the MySQL dialect.

use crate::errors::StoreError;
use crate::record::SqlValue;

/// Delimits an identifier with backticks, doubling embedded backticks.
///
/// # Examples
///
/// ```
/// use dbkit::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("name"), "`name`");
/// assert_eq!(quote_identifier("we`ird"), "`we``ird`");
/// ```
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Delimits a possibly schema-qualified table name (`schema.table`).
#[must_use]
pub fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

/// Escapes text for use inside a single-quoted MySQL string literal.
#[must_use]
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    for character in text.chars() {
        match character {
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\x1a' => escaped.push_str("\\Z"),
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Renders a coerced value as a SQL literal.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] for NaN or infinite floats, which have
/// no SQL literal.
///
/// # Examples
///
/// ```
/// use dbkit::record::SqlValue;
/// use dbkit::sql::render_literal;
///
/// assert_eq!(render_literal(&SqlValue::Null).unwrap(), "null");
/// assert_eq!(render_literal(&SqlValue::Text("it's".into())).unwrap(), r"'it\'s'");
/// ```
pub fn render_literal(value: &SqlValue) -> Result<String, StoreError> {
    match value {
        SqlValue::Null => Ok("null".to_string()),
        SqlValue::Integer(number) => Ok(number.to_string()),
        SqlValue::Float(number) if number.is_finite() => Ok(number.to_string()),
        SqlValue::Float(number) => Err(StoreError::validation(format!(
            "float value {number} has no SQL representation"
        ))),
        SqlValue::Text(text) => Ok(format!("'{}'", escape_text(text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("users", "`users`")]
    #[case("shop.orders", "`shop`.`orders`")]
    fn quote_table_delimits_each_part(#[case] table: &str, #[case] expected: &str) {
        assert_eq!(quote_table(table), expected);
    }

    #[rstest]
    #[case(SqlValue::Integer(-12), "-12")]
    #[case(SqlValue::Float(0.5), "0.5")]
    #[case(SqlValue::Text("a\\b".to_string()), r"'a\\b'")]
    #[case(SqlValue::Text("line\nbreak".to_string()), r"'line\nbreak'")]
    fn render_literal_cases(#[case] value: SqlValue, #[case] expected: &str) {
        assert_eq!(render_literal(&value).unwrap(), expected);
    }

    #[rstest]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    #[case(f64::NEG_INFINITY)]
    fn non_finite_float_is_rejected(#[case] number: f64) {
        let error = render_literal(&SqlValue::Float(number)).unwrap_err();
        assert!(error.is_validation());
    }

    /// Removes every backslash escape pair so only unescaped characters remain.
    fn strip_escapes(text: &str) -> String {
        let mut stripped = String::new();
        let mut characters = text.chars();
        while let Some(character) = characters.next() {
            if character == '\\' {
                characters.next();
            } else {
                stripped.push(character);
            }
        }
        stripped
    }

    proptest! {
        #[test]
        fn escaped_text_has_no_bare_quote(text in ".*") {
            let escaped = escape_text(&text);
            prop_assert!(!strip_escapes(&escaped).contains('\''));
        }

        #[test]
        fn identifier_has_balanced_backticks(name in ".*") {
            let quoted = quote_identifier(&name);
            let inner = &quoted[1..quoted.len() - 1];
            prop_assert_eq!(inner.replace("``", ""), name.replace('`', ""));
        }
    }
}
