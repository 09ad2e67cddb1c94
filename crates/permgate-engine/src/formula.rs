//! Formula to filter translation
//!
//! Only a narrow shape translates: top-level `||` of `&&` of atoms, where an
//! atom is `field OP literal`, a bare `field` (not null) or `!field` (null).
//! Literals are strings, numbers, booleans, `null` or `$current_user.<path>`,
//! which is resolved while translating. Everything else is rejected.

use serde_json::Value;

use permgate_common::error::TranslationError;
use permgate_common::types::{lookup_path, UserContext};

use crate::expr::{tokenize, Token};
use crate::filter::Filter;

const UNSUPPORTED_SHAPE: &str = "expected `field OP literal`, `field` or `!field`";

/// Translate a formula into a filter tree
///
/// # Errors
/// `TranslationError::UnsupportedFormula` when the formula leaves the
/// translatable subset.
pub fn formula_to_filter(formula: &str, user: Option<&UserContext>) -> Result<Filter, TranslationError> {
    let user = user.map_or(Value::Null, UserContext::to_value);
    let translator = Translator { formula, user: &user };
    translator.disjunction(formula)
}

struct Translator<'a> {
    formula: &'a str,
    user: &'a Value,
}

impl Translator<'_> {
    fn unsupported(&self, reason: impl Into<String>) -> TranslationError {
        TranslationError::UnsupportedFormula {
            formula: self.formula.to_string(),
            reason: reason.into(),
        }
    }

    fn disjunction(&self, text: &str) -> Result<Filter, TranslationError> {
        let parts = split_top_level(text, "||");
        if parts.len() == 1 {
            return self.conjunction(parts[0]);
        }
        let filters = parts
            .into_iter()
            .map(|part| self.conjunction(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Filter::Or(filters))
    }

    fn conjunction(&self, text: &str) -> Result<Filter, TranslationError> {
        let parts = split_top_level(text, "&&");
        if parts.len() == 1 {
            return self.atom(parts[0]);
        }
        let filters = parts
            .into_iter()
            .map(|part| self.atom(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Filter::And(filters))
    }

    fn atom(&self, text: &str) -> Result<Filter, TranslationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(self.unsupported("empty clause"));
        }
        let tokens = tokenize(text).map_err(|e| self.unsupported(e.to_string()))?;

        match tokens.as_slice() {
            [Token::Path(field)] => Ok(Filter::NotNull(field.clone())),
            [Token::Not, Token::Path(field)] => Ok(Filter::IsNull(field.clone())),
            [Token::Path(field), Token::Compare(op), literal] => {
                let value = self.literal(literal)?;
                Ok(Filter::compare(field, (*op).into(), value))
            }
            _ => Err(self.unsupported(UNSUPPORTED_SHAPE)),
        }
    }

    fn literal(&self, token: &Token) -> Result<Value, TranslationError> {
        match token {
            Token::Literal(value) => Ok(value.clone()),
            Token::UserPath(path) => Ok(lookup_path(self.user, path).cloned().unwrap_or(Value::Null)),
            _ => Err(self.unsupported("right-hand side must be a literal")),
        }
    }
}

/// Split on `separator` outside quoted strings
fn split_top_level<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let sep = separator.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if bytes[i..].starts_with(sep) => {
                parts.push(&text[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&text[start..]);
    parts
}
