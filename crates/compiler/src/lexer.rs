//! Lexer: source text to tokens.
//!
//! The input is decoded to code points up front; positions track the code
//! point index plus a 1-based column and row. Identifiers are
//! Unicode-aware (half-width katakana, combining diacritics, and the
//! Latin-1 supplement are all identifier characters), and back-tick
//! delimited runs lex to identifiers with arbitrary content.

use std::fmt;
use std::fs;
use std::path::Path;

/// Source position: code-point index, 1-based column and row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub idx: usize,
    pub col: usize,
    pub row: usize,
}

impl Pos {
    pub fn start() -> Pos {
        Pos { idx: 0, col: 1, row: 1 }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

/// Token kinds. A closed set: the parser matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokKind {
    Id,
    Number,
    Str,
    LParen,
    RParen,
    LCurly,
    RCurly,
    LSquare,
    RSquare,
    LObject,
    RObject,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Walrus,
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    Inc,
    Dec,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Or,
    And,
    Exclaim,
    Range,
    RArrow,
    LArrow,
    At,
    Backslash,
    If,
    Elif,
    Else,
    Fun,
    Ret,
    Next,
    Break,
    For,
    With,
    Of,
    True,
    False,
    Nil,
    Eof,
}

impl TokKind {
    pub fn name(self) -> &'static str {
        match self {
            TokKind::Id => "id",
            TokKind::Number => "number",
            TokKind::Str => "str",
            TokKind::LParen => "(",
            TokKind::RParen => ")",
            TokKind::LCurly => "{",
            TokKind::RCurly => "}",
            TokKind::LSquare => "[",
            TokKind::RSquare => "]",
            TokKind::LObject => "[|",
            TokKind::RObject => "|]",
            TokKind::Comma => ",",
            TokKind::Dot => ".",
            TokKind::Semicolon => ";",
            TokKind::Colon => ":",
            TokKind::Walrus => ":=",
            TokKind::Assign => "=",
            TokKind::Add => "+",
            TokKind::Sub => "-",
            TokKind::Mul => "*",
            TokKind::Div => "/",
            TokKind::Mod => "%",
            TokKind::AddAssign => "+=",
            TokKind::SubAssign => "-=",
            TokKind::MulAssign => "*=",
            TokKind::DivAssign => "/=",
            TokKind::ModAssign => "%=",
            TokKind::Inc => "++",
            TokKind::Dec => "--",
            TokKind::Eq => "==",
            TokKind::Neq => "<>",
            TokKind::Lt => "<",
            TokKind::Gt => ">",
            TokKind::Le => "<=",
            TokKind::Ge => ">=",
            TokKind::Or => "|",
            TokKind::And => "&",
            TokKind::Exclaim => "!",
            TokKind::Range => "..",
            TokKind::RArrow => "->",
            TokKind::LArrow => "<-",
            TokKind::At => "@",
            TokKind::Backslash => "\\",
            TokKind::If => "if",
            TokKind::Elif => "elif",
            TokKind::Else => "else",
            TokKind::Fun => "fun",
            TokKind::Ret => "ret",
            TokKind::Next => "next",
            TokKind::Break => "break",
            TokKind::For => "for",
            TokKind::With => "with",
            TokKind::Of => "of",
            TokKind::True => "true",
            TokKind::False => "false",
            TokKind::Nil => "nil",
            TokKind::Eof => "eof",
        }
    }
}

impl fmt::Display for TokKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokKind,
    pub lexeme: String,
    pub begin: Pos,
    pub end: Pos,
}

impl Token {
    fn new(kind: TokKind, lexeme: impl Into<String>, begin: Pos, end: Pos) -> Token {
        Token { kind, lexeme: lexeme.into(), begin, end }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' at {}", self.kind, self.lexeme, self.begin)
    }
}

fn keyword(text: &str) -> Option<TokKind> {
    Some(match text {
        "if" => TokKind::If,
        "elif" => TokKind::Elif,
        "else" => TokKind::Else,
        "fun" => TokKind::Fun,
        "ret" => TokKind::Ret,
        "next" => TokKind::Next,
        "break" => TokKind::Break,
        "for" => TokKind::For,
        "with" => TokKind::With,
        "of" => TokKind::Of,
        "true" => TokKind::True,
        "false" => TokKind::False,
        "nil" => TokKind::Nil,
        _ => return None,
    })
}

#[derive(Debug)]
pub struct Lexer {
    text: Vec<char>,
    pos: Pos,
    ch: char,
}

impl Lexer {
    /// Lex a source file from disk.
    pub fn from_path(path: &Path) -> Result<Lexer, String> {
        let source = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        Ok(Lexer::from_source(&source))
    }

    /// Lex in-memory source text.
    pub fn from_source(source: &str) -> Lexer {
        let text: Vec<char> = source.chars().collect();
        let ch = text.first().copied().unwrap_or('\0');
        Lexer { text, pos: Pos::start(), ch }
    }

    fn advance(&mut self) {
        match self.ch {
            '\n' => {
                self.pos.idx += 1;
                self.pos.row += 1;
                self.pos.col = 1;
            }
            // Carriage returns take no column.
            '\r' => self.pos.idx += 1,
            _ => {
                self.pos.idx += 1;
                self.pos.col += 1;
            }
        }
        self.ch = self.text.get(self.pos.idx).copied().unwrap_or('\0');
    }

    fn is_id_start(ch: char) -> bool {
        ch.is_ascii_alphabetic()
            || ch == '_'
            || ch == '$'
            || ('\u{ff61}'..='\u{ff9f}').contains(&ch) // half-width katakana
            || ('\u{0300}'..='\u{036f}').contains(&ch) // combining diacritics
            || ('\u{0080}'..='\u{00ff}').contains(&ch) // Latin-1 supplement
    }

    fn is_id_continue(ch: char) -> bool {
        Self::is_id_start(ch) || ch.is_ascii_digit()
    }

    /// Produce the whole token stream, ending with a single `eof` token.
    pub fn lex(mut self) -> Result<Vec<Token>, String> {
        let mut toks = Vec::new();

        while self.pos.idx < self.text.len() {
            let begin = self.pos;
            if Self::is_id_start(self.ch) {
                let mut buf = String::new();
                while Self::is_id_continue(self.ch) {
                    buf.push(self.ch);
                    self.advance();
                }
                let kind = keyword(&buf).unwrap_or(TokKind::Id);
                toks.push(Token::new(kind, buf, begin, self.pos));
            } else if self.ch == '=' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::Eq, "==", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Assign, "=", begin, self.pos));
                }
            } else if self.ch == '[' {
                self.advance();
                if self.ch == '|' {
                    self.advance();
                    toks.push(Token::new(TokKind::LObject, "[|", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::LSquare, "[", begin, self.pos));
                }
            } else if self.ch == '|' {
                self.advance();
                if self.ch == ']' {
                    self.advance();
                    toks.push(Token::new(TokKind::RObject, "|]", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Or, "|", begin, self.pos));
                }
            } else if self.ch == '+' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::AddAssign, "+=", begin, self.pos));
                } else if self.ch == '+' {
                    self.advance();
                    toks.push(Token::new(TokKind::Inc, "++", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Add, "+", begin, self.pos));
                }
            } else if self.ch == '-' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::SubAssign, "-=", begin, self.pos));
                } else if self.ch == '>' {
                    self.advance();
                    toks.push(Token::new(TokKind::RArrow, "->", begin, self.pos));
                } else if self.ch == '-' {
                    self.advance();
                    toks.push(Token::new(TokKind::Dec, "--", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Sub, "-", begin, self.pos));
                }
            } else if self.ch == '<' {
                self.advance();
                if self.ch == '>' {
                    self.advance();
                    toks.push(Token::new(TokKind::Neq, "<>", begin, self.pos));
                } else if self.ch == '-' {
                    self.advance();
                    toks.push(Token::new(TokKind::LArrow, "<-", begin, self.pos));
                } else if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::Le, "<=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Lt, "<", begin, self.pos));
                }
            } else if self.ch == '>' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::Ge, ">=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Gt, ">", begin, self.pos));
                }
            } else if self.ch == '/' {
                self.advance();
                if self.ch == '/' {
                    while self.ch != '\n' && self.ch != '\0' {
                        self.advance();
                    }
                } else if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::DivAssign, "/=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Div, "/", begin, self.pos));
                }
            } else if self.ch == '*' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::MulAssign, "*=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Mul, "*", begin, self.pos));
                }
            } else if self.ch == '%' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::ModAssign, "%=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Mod, "%", begin, self.pos));
                }
            } else if self.ch == ':' {
                self.advance();
                if self.ch == '=' {
                    self.advance();
                    toks.push(Token::new(TokKind::Walrus, ":=", begin, self.pos));
                } else {
                    toks.push(Token::new(TokKind::Colon, ":", begin, self.pos));
                }
            } else if let Some(kind) = simple_symbol(self.ch) {
                let lexeme = self.ch.to_string();
                self.advance();
                toks.push(Token::new(kind, lexeme, begin, self.pos));
            } else if self.ch.is_ascii_digit() {
                let mut buf = String::new();
                let mut range = false;
                while self.ch.is_ascii_digit() || self.ch == '.' {
                    buf.push(self.ch);
                    self.advance();
                    // `1..5` is a number followed by a range token, not a
                    // malformed float.
                    if buf.ends_with("..") {
                        buf.truncate(buf.len() - 2);
                        range = true;
                        break;
                    }
                }
                toks.push(Token::new(TokKind::Number, buf, begin, self.pos));
                if range {
                    toks.push(Token::new(TokKind::Range, "..", begin, self.pos));
                }
            } else if self.ch == '"' {
                self.advance();
                let mut buf = String::new();
                while self.ch != '"' {
                    if self.ch == '\0' {
                        return Err(format!("Unterminated string literal starting at {begin}"));
                    }
                    if self.ch == '\\' {
                        self.advance();
                        match self.ch {
                            'n' => buf.push('\n'),
                            other => {
                                return Err(format!(
                                    "Unknown escape character {other} at {}",
                                    self.pos
                                ));
                            }
                        }
                        self.advance();
                    } else {
                        buf.push(self.ch);
                        self.advance();
                    }
                }
                self.advance();
                toks.push(Token::new(TokKind::Str, buf, begin, self.pos));
            } else if self.ch == '`' {
                self.advance();
                let mut buf = String::new();
                while self.ch != '`' {
                    if self.ch == '\0' {
                        return Err(format!("Unterminated back-tick identifier starting at {begin}"));
                    }
                    buf.push(self.ch);
                    self.advance();
                }
                self.advance();
                toks.push(Token::new(TokKind::Id, buf, begin, self.pos));
            } else if matches!(self.ch, ' ' | '\t' | '\n' | '\r') {
                self.advance();
            } else {
                return Err(format!(
                    "Failed to read next token at {} with character {}",
                    self.pos, self.ch as u32
                ));
            }
        }

        toks.push(Token::new(TokKind::Eof, "", self.pos, self.pos));
        Ok(toks)
    }
}

fn simple_symbol(ch: char) -> Option<TokKind> {
    Some(match ch {
        ']' => TokKind::RSquare,
        '{' => TokKind::LCurly,
        '}' => TokKind::RCurly,
        '(' => TokKind::LParen,
        ')' => TokKind::RParen,
        '&' => TokKind::And,
        ',' => TokKind::Comma,
        '.' => TokKind::Dot,
        '!' => TokKind::Exclaim,
        ';' => TokKind::Semicolon,
        '\\' => TokKind::Backslash,
        '@' => TokKind::At,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokKind> {
        Lexer::from_source(source)
            .lex()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn arithmetic_and_compound_operators() {
        assert_eq!(
            kinds("a += b * c"),
            vec![TokKind::Id, TokKind::AddAssign, TokKind::Id, TokKind::Mul, TokKind::Id, TokKind::Eof]
        );
    }

    #[test]
    fn number_followed_by_range() {
        let toks = Lexer::from_source("1..5").lex().unwrap();
        assert_eq!(toks[0].kind, TokKind::Number);
        assert_eq!(toks[0].lexeme, "1");
        assert_eq!(toks[1].kind, TokKind::Range);
        assert_eq!(toks[2].kind, TokKind::Number);
        assert_eq!(toks[2].lexeme, "5");
    }

    #[test]
    fn decimal_numbers_keep_their_dot() {
        let toks = Lexer::from_source("3.25").lex().unwrap();
        assert_eq!(toks[0].lexeme, "3.25");
    }

    #[test]
    fn object_delimiters() {
        assert_eq!(
            kinds("[| x = 1 |]"),
            vec![TokKind::LObject, TokKind::Id, TokKind::Assign, TokKind::Number, TokKind::RObject, TokKind::Eof]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("if elif else ret for with of foo"),
            vec![
                TokKind::If,
                TokKind::Elif,
                TokKind::Else,
                TokKind::Ret,
                TokKind::For,
                TokKind::With,
                TokKind::Of,
                TokKind::Id,
                TokKind::Eof
            ]
        );
    }

    #[test]
    fn unicode_identifiers() {
        // Half-width katakana and Latin-1 letters are identifier characters.
        let toks = Lexer::from_source("ｱｲｳ := café").lex().unwrap();
        assert_eq!(toks[0].kind, TokKind::Id);
        assert_eq!(toks[0].lexeme, "ｱｲｳ");
        assert_eq!(toks[1].kind, TokKind::Walrus);
        assert_eq!(toks[2].kind, TokKind::Id);
    }

    #[test]
    fn backtick_identifiers_take_anything() {
        let toks = Lexer::from_source("`two words`").lex().unwrap();
        assert_eq!(toks[0].kind, TokKind::Id);
        assert_eq!(toks[0].lexeme, "two words");
    }

    #[test]
    fn string_escapes() {
        let toks = Lexer::from_source("\"a\\nb\"").lex().unwrap();
        assert_eq!(toks[0].kind, TokKind::Str);
        assert_eq!(toks[0].lexeme, "a\nb");
    }

    #[test]
    fn unknown_escape_fails() {
        let err = Lexer::from_source("\"a\\qb\"").lex().unwrap_err();
        assert!(err.contains("Unknown escape character q"), "got: {err}");
    }

    #[test]
    fn unterminated_string_fails() {
        let err = Lexer::from_source("\"abc").lex().unwrap_err();
        assert!(err.contains("Unterminated string"), "got: {err}");
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // ignored to end of line\n2"),
            vec![TokKind::Number, TokKind::Number, TokKind::Eof]
        );
    }

    #[test]
    fn unknown_character_reports_position_and_code_point() {
        let err = Lexer::from_source("  #").lex().unwrap_err();
        assert!(err.contains("1:3"), "got: {err}");
        assert!(err.contains("35"), "got: {err}");
    }

    #[test]
    fn positions_track_rows_and_columns() {
        let toks = Lexer::from_source("a\n  b").lex().unwrap();
        assert_eq!((toks[0].begin.row, toks[0].begin.col), (1, 1));
        assert_eq!((toks[1].begin.row, toks[1].begin.col), (2, 3));
    }

    #[test]
    fn lexes_from_a_file_path() {
        use std::io::Write as _;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "x := 1").unwrap();
        let toks = Lexer::from_path(file.path()).unwrap().lex().unwrap();
        assert_eq!(toks[0].kind, TokKind::Id);
        assert_eq!(toks[1].kind, TokKind::Walrus);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Lexer::from_path(Path::new("/no/such/file.ayu")).unwrap_err();
        assert!(err.contains("/no/such/file.ayu"), "got: {err}");
    }

    #[test]
    fn arrows_and_walrus() {
        assert_eq!(
            kinds("-> <- :="),
            vec![TokKind::RArrow, TokKind::LArrow, TokKind::Walrus, TokKind::Eof]
        );
    }
}
