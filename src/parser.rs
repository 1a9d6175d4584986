//! implements a parser for the reply lines of the upsd TCP protocol.
use std::fmt;
use std::str;

use crate::types::protocol::UpsUnit;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnexpectedKeyword,
    /// Well formed, but about a different unit or variable than was asked.
    Mismatched,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnexpectedKeyword => "unexpected keyword",
            Self::Mismatched => "reply answers a different request",
        })
    }
}

impl std::error::Error for ParsingError {}

/// A `VAR <ups> <name> "<value>"` reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VarLine {
    pub ups: String,
    pub name: String,
    pub value: String,
}

/// Provides a custom, minimal parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&str, ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            str::from_utf8(token).map_err(|_| ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting exactly the given keyword.
    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParsingError> {
        if self.expect_next_token()? == keyword {
            Ok(())
        } else {
            Err(ParsingError::UnexpectedKeyword)
        }
    }

    /// Consumes from the input, expecting a space then a bare word.
    fn expect_next_word(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        Ok(self.expect_next_token()?.to_owned())
    }

    /// Consumes from the input, expecting a space then a double-quoted string.
    /// Inside the quotes, `\"` and `\\` stand for `"` and `\`.
    fn expect_next_quoted(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let Some((&b'"', rest)) = self.from.split_first() else {
            return Err(ParsingError::BadFormat);
        };

        let mut value = Vec::with_capacity(rest.len());
        let mut bytes = rest.iter().enumerate();
        while let Some((i, &c)) = bytes.next() {
            match c {
                b'"' => {
                    self.from = &rest[i + 1..];
                    return String::from_utf8(value)
                        .map_err(|_| ParsingError::BadFormat);
                },
                b'\\' => match bytes.next() {
                    Some((_, &escaped)) => value.push(escaped),
                    None => break,
                },
                _ => value.push(c),
            }
        }

        // Ran out of input before the closing quote.
        Err(ParsingError::BadFormat)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parses a `LIST UPS` content line: `UPS <name> "<description>"`.
impl TryFrom<&[u8]> for UpsUnit {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut ps: ParseState = value.into();

        ps.expect_keyword("UPS")?;
        let unit = UpsUnit {
            name: ps.expect_next_word()?,
            description: ps.expect_next_quoted()?,
        };

        ps.expect_done_and(unit)
    }
}

// Parses a `GET VAR` reply: `VAR <ups> <name> "<value>"`.
impl TryFrom<&[u8]> for VarLine {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut ps: ParseState = value.into();

        ps.expect_keyword("VAR")?;
        let var = VarLine {
            ups: ps.expect_next_word()?,
            name: ps.expect_next_word()?,
            value: ps.expect_next_quoted()?,
        };

        ps.expect_done_and(var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParsingError::*;

    #[test]
    fn test_parse_ups_line() {
        #[track_caller]
        fn ok(line: &[u8], name: &str, description: &str) {
            assert_eq!(
                line.try_into(),
                Ok(UpsUnit {
                    name: name.into(),
                    description: description.into(),
                })
            );
        }

        #[track_caller]
        fn err(line: &[u8], e: ParsingError) {
            assert_eq!(TryInto::<UpsUnit>::try_into(line), Err(e));
        }

        ok(br#"UPS myups "Test UPS""#, "myups", "Test UPS");
        ok(
            br#"UPS su700 "Back \"room\" \\ rack""#,
            "su700",
            r#"Back "room" \ rack"#,
        );
        ok(br#"UPS bare """#, "bare", "");

        err(b"", BadFormat);
        err(br#"VAR myups "Test UPS""#, UnexpectedKeyword);
        err(br#"UPS  myups "Test UPS""#, BadFormat);
        err(br#"UPS myups Test"#, BadFormat);
        err(br#"UPS myups "unterminated"#, BadFormat);
        err(br#"UPS myups "Test UPS" trailing"#, BadFormat);
        err(b"UPS myups", BadFormat);
    }

    #[test]
    fn test_parse_var_line() {
        assert_eq!(
            br#"VAR myups input.voltage "231.50000""#.as_slice().try_into(),
            Ok(VarLine {
                ups: "myups".into(),
                name: "input.voltage".into(),
                value: "231.50000".into(),
            })
        );
        assert_eq!(
            TryInto::<VarLine>::try_into(
                br#"VAR myups ups.status "OL CHRG""#.as_slice()
            )
            .map(|v| v.value),
            Ok("OL CHRG".into())
        );

        assert_eq!(
            TryInto::<VarLine>::try_into(b"ERR VAR-NOT-SUPPORTED".as_slice()),
            Err(UnexpectedKeyword)
        );
        assert_eq!(
            TryInto::<VarLine>::try_into(br#"VAR myups "231""#.as_slice()),
            Err(BadFormat)
        );
    }
}
