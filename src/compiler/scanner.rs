use radix_trie::Trie;
use thiserror::Error;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

#[derive(Debug, Clone, Error)]
pub enum ScannerError {
    #[error("[line {0}] Error: Unterminated string.")]
    UnterminatedString(u64),

    #[error("[line {0}] Error: Unexpected character.")]
    UnexpectedCharacter(u64),
}

const KEYWORDS: [(&str, TokenKind); 16] = [
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("super", TokenKind::Super),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

/// On-demand tokenizer. Each call to `scan_token` slices one lexeme out of
/// the source; the compiler drives it a token at a time.
pub struct Scanner<'a> {
    source: &'a str,
    cursor: StrCursor<'a>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut keywords = Trie::new();
        for (keyword, kind) in KEYWORDS.iter() {
            keywords.insert(*keyword, *kind);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Result<Token, ScannerError> {
        self.skip_whitespace();
        self.start = self.cursor.index;

        let ch = match self.cursor.advance() {
            Some(ch) => ch,
            None => return Ok(self.create_token(TokenKind::EOF)),
        };

        let token = match ch {
            '(' => self.create_token(TokenKind::ParenLeft),
            ')' => self.create_token(TokenKind::ParenRight),
            '{' => self.create_token(TokenKind::BraceLeft),
            '}' => self.create_token(TokenKind::BraceRight),
            ';' => self.create_token(TokenKind::Semicolon),
            ',' => self.create_token(TokenKind::Comma),
            '.' => self.create_token(TokenKind::Dot),
            '-' => self.create_token(TokenKind::Minus),
            '+' => self.create_token(TokenKind::Plus),
            '/' => self.create_token(TokenKind::Slash),
            '*' => self.create_token(TokenKind::Star),
            '!' => self.create_token_match('=', TokenKind::BangEqual, TokenKind::Bang),
            '=' => self.create_token_match('=', TokenKind::EqualEqual, TokenKind::Equal),
            '<' => self.create_token_match('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.create_token_match('=', TokenKind::GreaterEqual, TokenKind::Greater),
            '"' => self.create_string_token()?,
            ch if ch.is_ascii_digit() => self.create_digit_token(),
            ch if ch.is_alphabetic() || ch == '_' => self.create_identifier_token(),
            _ => return Err(ScannerError::UnexpectedCharacter(self.line)),
        };
        Ok(token)
    }

    fn match_token(&mut self, expected: char) -> bool {
        if let Some(ch) = self.cursor.peek() {
            if ch == expected {
                self.cursor.advance();
                return true;
            }
        }
        false
    }

    fn create_token(&self, kind: TokenKind) -> Token {
        let data = self.source[self.start..self.cursor.index].to_owned();
        Token::new(kind, data, self.line)
    }

    fn create_token_match(&mut self, matches: char, if_matches: TokenKind, otherwise: TokenKind) -> Token {
        if self.match_token(matches) {
            self.create_token(if_matches)
        } else {
            self.create_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                '/' => {
                    if self.cursor.peek_next() == Some('/') {
                        self.cursor.advance_until(|ch| ch == '\n');
                    } else {
                        return;
                    }
                }
                ch if ch.is_whitespace() => {
                    self.cursor.advance();
                }
                _ => return,
            }
        }
    }

    fn create_identifier_token(&mut self) -> Token {
        self.cursor
            .advance_when(|ch| ch.is_alphanumeric() || ch == '_');

        let identifier = &self.source[self.start..self.cursor.index];
        if let Some(kind) = self.keywords.get(identifier) {
            self.create_token(*kind)
        } else {
            self.create_token(TokenKind::Identifier)
        }
    }

    fn create_digit_token(&mut self) -> Token {
        let check_digit = |ch: char| ch.is_ascii_digit();

        self.cursor.advance_when(check_digit);

        // A trailing dot belongs to a property access, not the number, so
        // only consume it when a digit follows.
        if self.cursor.peek() == Some('.') {
            if let Some(ch) = self.cursor.peek_next() {
                if check_digit(ch) {
                    self.cursor.advance();
                    self.cursor.advance_when(check_digit);
                }
            }
        }

        self.create_token(TokenKind::Number)
    }

    fn create_string_token(&mut self) -> Result<Token, ScannerError> {
        loop {
            match self.cursor.peek() {
                Some('"') => {
                    self.cursor.advance();
                    break;
                }
                Some(ch) => {
                    if ch == '\n' {
                        self.line += 1;
                    }
                    self.cursor.advance();
                }
                None => return Err(ScannerError::UnterminatedString(self.line)),
            }
        }

        Ok(self.create_token(TokenKind::String))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token().unwrap();
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::EOF {
                break;
            }
        }
        kinds
    }

    #[test]
    fn scan_punctuation_pairs() {
        assert_eq!(
            kinds("! != = == < <= > >="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_keywords_and_identifiers() {
        assert_eq!(
            kinds("class classy this ego _tmp"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::This,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_number_then_property() {
        // `1.foo` is a property access on a number, not a malformed float.
        assert_eq!(
            kinds("12.5 1.foo"),
            vec![
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_comments_and_lines() {
        let mut scanner = Scanner::new("// nothing here\nprint");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::Print);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn scan_multiline_string() {
        let mut scanner = Scanner::new("\"one\ntwo\"");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.data, "\"one\ntwo\"");
    }

    #[test]
    fn scan_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnterminatedString(_))
        ));
    }

    #[test]
    fn scan_unexpected_character() {
        let mut scanner = Scanner::new("@");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnexpectedCharacter(_))
        ));
    }
}
