//! Tokenizers for the server's compound text formats.

use crate::error::{Error, Result};

/// Character cursor over a compound literal.
pub(crate) struct Scanner<'a> {
    input: &'a str,
    pos: usize,
    type_name: &'a str,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a str, type_name: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            type_name,
        }
    }

    pub(crate) fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    pub(crate) fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub(crate) fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub(crate) fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub(crate) fn expect(&mut self, expected: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    pub(crate) fn eat(&mut self, expected: &str) -> bool {
        if self.rest().starts_with(expected) {
            self.pos += expected.len();
            true
        } else {
            false
        }
    }

    /// Read a double quoted string. The opening quote must be the next char.
    /// Backslash escapes the next char; `""` inside the string is one quote.
    pub(crate) fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("dangling escape")),
                },
                Some('"') => {
                    if self.peek() == Some('"') {
                        self.bump();
                        out.push('"');
                    } else {
                        return Ok(out);
                    }
                }
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated quoted string")),
            }
        }
    }

    /// Read unquoted text up to (not including) any of `stops`.
    /// Backslash escapes are honoured.
    pub(crate) fn unquoted(&mut self, stops: &[char]) -> Result<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.bump();
            if c == '\\' {
                match self.bump() {
                    Some(escaped) => out.push(escaped),
                    None => return Err(self.error("dangling escape")),
                }
            } else {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub(crate) fn error(&self, reason: impl Into<String>) -> Error {
        Error::conversion(self.type_name, self.input, reason)
    }
}

// ============================================================================
// Arrays
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArrayItem {
    Null,
    Text(String),
    Nested(Vec<ArrayItem>),
}

/// Split `{a,"b c",NULL,{1,2}}` into items.
pub(crate) fn parse_array(input: &str, type_name: &str) -> Result<Vec<ArrayItem>> {
    let mut scanner = Scanner::new(input.trim(), type_name);
    let items = array_items(&mut scanner)?;
    scanner.skip_whitespace();
    if !scanner.is_done() {
        return Err(scanner.error("trailing characters after array"));
    }
    Ok(items)
}

fn array_items(scanner: &mut Scanner<'_>) -> Result<Vec<ArrayItem>> {
    scanner.expect('{')?;
    let mut items = Vec::new();
    scanner.skip_whitespace();
    if scanner.peek() == Some('}') {
        scanner.bump();
        return Ok(items);
    }

    loop {
        scanner.skip_whitespace();
        let item = match scanner.peek() {
            Some('{') => ArrayItem::Nested(array_items(scanner)?),
            Some('"') => ArrayItem::Text(scanner.quoted()?),
            Some(_) => {
                let raw = scanner.unquoted(&[',', '}'])?;
                let raw = raw.trim();
                if raw.eq_ignore_ascii_case("NULL") {
                    ArrayItem::Null
                } else {
                    ArrayItem::Text(raw.to_string())
                }
            }
            None => return Err(scanner.error("unterminated array")),
        };
        items.push(item);

        scanner.skip_whitespace();
        match scanner.bump() {
            Some(',') => continue,
            Some('}') => return Ok(items),
            Some(c) => return Err(scanner.error(format!("unexpected '{}' in array", c))),
            None => return Err(scanner.error("unterminated array")),
        }
    }
}

/// Quote an array element when the server would misread it bare.
pub(crate) fn quote_array_element(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.eq_ignore_ascii_case("NULL")
        || s.chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if needs_quotes {
        quote_with_backslashes(s)
    } else {
        s.to_string()
    }
}

// ============================================================================
// Composite rows
// ============================================================================

/// Split `(1,"a b",,"")` into fields. An empty unquoted field is NULL, an
/// empty quoted field is the empty string.
pub(crate) fn parse_row(input: &str, type_name: &str) -> Result<Vec<Option<String>>> {
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::conversion(type_name, input, "composite value must be parenthesized"))?;

    let mut scanner = Scanner::new(inner, type_name);
    let mut fields = Vec::new();
    loop {
        let field = if scanner.peek() == Some('"') {
            // A quoted section may be followed by more unquoted text.
            let mut text = scanner.quoted()?;
            text.push_str(&scanner.unquoted(&[','])?);
            Some(text)
        } else {
            let raw = scanner.unquoted(&[','])?;
            if raw.is_empty() {
                None
            } else {
                Some(raw)
            }
        };
        fields.push(field);

        match scanner.bump() {
            Some(',') => continue,
            None => return Ok(fields),
            Some(c) => return Err(scanner.error(format!("unexpected '{}' in composite", c))),
        }
    }
}

/// Quote a composite field when the server would misread it bare.
pub(crate) fn quote_row_field(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.chars()
            .any(|c| matches!(c, '(' | ')' | ',' | '"' | '\\') || c.is_whitespace());
    if needs_quotes {
        quote_with_backslashes(s)
    } else {
        s.to_string()
    }
}

pub(crate) fn quote_with_backslashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ============================================================================
// Ranges
// ============================================================================

#[derive(Debug, PartialEq)]
pub(crate) struct RangeParts {
    pub lower: Option<String>,
    pub upper: Option<String>,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
}

/// Split `[a,b)` into its bounds. Returns `None` for `empty`.
pub(crate) fn parse_range(input: &str, type_name: &str) -> Result<Option<RangeParts>> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("empty") {
        return Ok(None);
    }

    let mut scanner = Scanner::new(trimmed, type_name);
    let lower_inclusive = match scanner.bump() {
        Some('[') => true,
        Some('(') => false,
        _ => return Err(scanner.error("range must start with '[' or '('")),
    };

    let lower = range_bound(&mut scanner)?;
    scanner.expect(',')?;
    let upper = range_bound(&mut scanner)?;

    let upper_inclusive = match scanner.bump() {
        Some(']') => true,
        Some(')') => false,
        _ => return Err(scanner.error("range must end with ']' or ')'")),
    };
    if !scanner.is_done() {
        return Err(scanner.error("trailing characters after range"));
    }

    Ok(Some(RangeParts {
        lower,
        upper,
        lower_inclusive,
        upper_inclusive,
    }))
}

fn range_bound(scanner: &mut Scanner<'_>) -> Result<Option<String>> {
    if scanner.peek() == Some('"') {
        return scanner.quoted().map(Some);
    }
    let raw = scanner.unquoted(&[',', ']', ')'])?;
    let raw = raw.trim();
    if raw.is_empty() {
        Ok(None)
    } else {
        Ok(Some(raw.to_string()))
    }
}
