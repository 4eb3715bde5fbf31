//! Lexical statement splitting
//!
//! A small lexer that understands just enough SQL to find statement
//! boundaries: quoted strings and identifiers, dollar-quoted bodies, and both
//! comment styles. It also carries the leading-keyword classification and
//! the `ORDER BY` scan used for input the SQL parser rejects.

use super::StatementKind;
use std::ops::Range;

/// One statement of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement<'a> {
    /// Statement SQL without surrounding whitespace, comments or separator
    pub text: &'a str,
    /// Source region owned by this statement; the spans of a script tile it
    pub span: Range<usize>,
    pub kind: StatementKind,
}

/// Split a script into statements
///
/// Semicolons inside strings, quoted identifiers, dollar-quoted bodies and
/// comments are not separators. Segments holding nothing but whitespace or
/// comments are folded into a neighbouring statement, so every returned
/// statement is non-empty and the spans cover the input without gaps.
pub fn split_statements(sql: &str) -> Vec<Statement<'_>> {
    let mut segments = Vec::new();
    let mut current = Segment::starting_at(0);

    for token in Lexer::new(sql) {
        match token.kind {
            TokenKind::Semicolon => {
                current.end = token.end();
                segments.push(current);
                current = Segment::starting_at(token.end());
            }
            TokenKind::Whitespace | TokenKind::Comment => {}
            TokenKind::Unterminated => {
                current.add_code(&token);
                current.unterminated = true;
            }
            _ => current.add_code(&token),
        }
    }
    if current.start < sql.len() {
        current.end = sql.len();
        segments.push(current);
    }

    let mut statements: Vec<Statement<'_>> = Vec::new();
    let mut carried_start = None;

    for segment in segments {
        let Some(code) = segment.code.clone() else {
            match statements.last_mut() {
                Some(previous) => previous.span.end = segment.end,
                None => {
                    carried_start.get_or_insert(segment.start);
                }
            }
            continue;
        };

        let text = &sql[code];
        let kind = if segment.unterminated {
            StatementKind::Unknown
        } else {
            statement_kind(text)
        };
        let start = carried_start.take().unwrap_or(segment.start);

        statements.push(Statement {
            text,
            span: start..segment.end,
            kind,
        });
    }

    statements
}

/// Shallow check for an `ORDER BY` outside any parentheses, strings or comments
pub(crate) fn has_order_by(sql: &str) -> bool {
    let mut depth = 0usize;
    let mut after_order = false;

    for token in Lexer::new(sql) {
        match token.kind {
            TokenKind::Whitespace | TokenKind::Comment => continue,
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => depth = depth.saturating_sub(1),
            TokenKind::Word if depth == 0 => {
                if after_order && token.text.eq_ignore_ascii_case("BY") {
                    return true;
                }
                after_order = token.text.eq_ignore_ascii_case("ORDER");
                continue;
            }
            _ => {}
        }
        after_order = false;
    }

    false
}

/// Kind from the leading keyword, escalated by data-modifying CTE bodies
pub(crate) fn statement_kind(text: &str) -> StatementKind {
    let mut tokens = Lexer::new(text).filter(|token| {
        !matches!(
            token.kind,
            TokenKind::Whitespace | TokenKind::Comment | TokenKind::OpenParen
        )
    });

    let Some(leading) = tokens.next() else {
        return StatementKind::Unknown;
    };
    if leading.kind != TokenKind::Word {
        return StatementKind::Unknown;
    }

    let kind = if leading.text.eq_ignore_ascii_case("WITH") {
        common_table_expression_kind(&text[leading.end()..])
    } else {
        StatementKind::from_keyword(leading.text)
    };

    if kind == StatementKind::Select && selects_into(text) {
        return StatementKind::Create;
    }
    kind
}

/// Kind of a `WITH` statement: its main verb, escalated by any data-modifying
/// CTE body
fn common_table_expression_kind(rest: &str) -> StatementKind {
    let mut depth = 0usize;
    let mut opened_body = false;
    let mut kind = None::<StatementKind>;

    for token in Lexer::new(rest) {
        match token.kind {
            TokenKind::Whitespace | TokenKind::Comment => {}
            TokenKind::OpenParen => {
                depth += 1;
                opened_body = depth == 1;
            }
            TokenKind::CloseParen => {
                depth = depth.saturating_sub(1);
                opened_body = false;
            }
            TokenKind::Word => {
                let word_kind = StatementKind::from_keyword(token.text);
                let modifies = word_kind.is_destructive() || word_kind == StatementKind::Insert;
                if opened_body && modifies {
                    kind = Some(kind.map_or(word_kind, |current| current.most_dangerous(word_kind)));
                }
                opened_body = false;

                if depth == 0 && is_main_verb(token.text) {
                    return kind.map_or(word_kind, |cte| cte.most_dangerous(word_kind));
                }
            }
            _ => opened_body = false,
        }
    }

    StatementKind::Unknown
}

fn is_main_verb(word: &str) -> bool {
    ["SELECT", "INSERT", "UPDATE", "DELETE", "VALUES", "TABLE"]
        .iter()
        .any(|verb| word.eq_ignore_ascii_case(verb))
}

/// `SELECT ... INTO new_table` creates a table
fn selects_into(text: &str) -> bool {
    let mut depth = 0usize;
    for token in Lexer::new(text) {
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => depth = depth.saturating_sub(1),
            TokenKind::Word if depth == 0 && token.text.eq_ignore_ascii_case("INTO") => return true,
            _ => {}
        }
    }
    false
}

#[derive(Debug, Clone)]
struct Segment {
    start: usize,
    end: usize,
    code: Option<Range<usize>>,
    unterminated: bool,
}

impl Segment {
    fn starting_at(start: usize) -> Self {
        Self {
            start,
            end: start,
            code: None,
            unterminated: false,
        }
    }

    fn add_code(&mut self, token: &Token<'_>) {
        let range = match self.code.take() {
            Some(code) => code.start..token.end(),
            None => token.start..token.end(),
        };
        self.code = Some(range);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Quoted,
    Comment,
    Whitespace,
    Semicolon,
    OpenParen,
    CloseParen,
    Symbol,
    /// A string, quoted identifier or comment running to end of input
    Unterminated,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    start: usize,
}

impl Token<'_> {
    fn end(&self) -> usize {
        self.start + self.text.len()
    }
}

struct Lexer<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.sql[self.pos..]
    }

    fn emit(&mut self, kind: TokenKind, len: usize) -> Token<'a> {
        let start = self.pos;
        self.pos += len;
        Token {
            kind,
            text: &self.sql[start..self.pos],
            start,
        }
    }

    /// Length of a quoted run starting at the opening quote, doubling as escape
    fn quoted_len(rest: &str, quote: char, backslash_escapes: bool) -> Option<usize> {
        let mut chars = rest.char_indices().skip(1).peekable();
        while let Some((index, character)) = chars.next() {
            if backslash_escapes && character == '\\' {
                chars.next();
            } else if character == quote {
                if chars.peek().map(|(_, next)| *next) == Some(quote) {
                    chars.next();
                } else {
                    return Some(index + character.len_utf8());
                }
            }
        }
        None
    }

    /// Length of a dollar-quoted body, or `None` if `$` does not open one
    fn dollar_quoted_len(rest: &str) -> Option<Result<usize, ()>> {
        let tag_end = rest[1..].find('$')? + 1;
        let tag = &rest[1..tag_end];
        let valid_tag = tag.chars().enumerate().all(|(index, character)| {
            character == '_' || character.is_alphabetic() || (index > 0 && character.is_ascii_digit())
        });
        if !valid_tag {
            return None;
        }

        let delimiter = &rest[..=tag_end];
        let body = &rest[delimiter.len()..];
        Some(match body.find(delimiter) {
            Some(close) => Ok(delimiter.len() + close + delimiter.len()),
            None => Err(()),
        })
    }

    fn block_comment_len(rest: &str) -> Option<usize> {
        let bytes = rest.as_bytes();
        let mut depth = 0usize;
        let mut index = 0;
        while index + 1 < bytes.len() {
            match (bytes[index], bytes[index + 1]) {
                (b'/', b'*') => {
                    depth += 1;
                    index += 2;
                }
                (b'*', b'/') => {
                    depth -= 1;
                    index += 2;
                    if depth == 0 {
                        return Some(index);
                    }
                }
                _ => index += 1,
            }
        }
        None
    }
}

fn is_word_char(character: char) -> bool {
    character.is_alphanumeric() || character == '_' || character == '$'
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let rest = self.rest();
        let mut chars = rest.chars();
        let first = chars.next()?;
        let second = chars.next();

        let unterminated = rest.len();
        let token = match (first, second) {
            (character, _) if character.is_whitespace() => {
                let len = rest
                    .find(|c: char| !c.is_whitespace())
                    .unwrap_or(rest.len());
                self.emit(TokenKind::Whitespace, len)
            }
            ('-', Some('-')) => {
                let len = rest.find('\n').unwrap_or(rest.len());
                self.emit(TokenKind::Comment, len)
            }
            ('/', Some('*')) => match Self::block_comment_len(rest) {
                Some(len) => self.emit(TokenKind::Comment, len),
                None => self.emit(TokenKind::Unterminated, unterminated),
            },
            ('e' | 'E', Some('\'')) => match Self::quoted_len(&rest[1..], '\'', true) {
                Some(len) => self.emit(TokenKind::Quoted, len + 1),
                None => self.emit(TokenKind::Unterminated, unterminated),
            },
            ('\'' | '"' | '`', _) => match Self::quoted_len(rest, first, false) {
                Some(len) => self.emit(TokenKind::Quoted, len),
                None => self.emit(TokenKind::Unterminated, unterminated),
            },
            ('$', _) => match Self::dollar_quoted_len(rest) {
                Some(Ok(len)) => self.emit(TokenKind::Quoted, len),
                Some(Err(())) => self.emit(TokenKind::Unterminated, unterminated),
                None => self.emit(TokenKind::Symbol, 1),
            },
            (';', _) => self.emit(TokenKind::Semicolon, 1),
            ('(', _) => self.emit(TokenKind::OpenParen, 1),
            (')', _) => self.emit(TokenKind::CloseParen, 1),
            (character, _) if is_word_char(character) => {
                let len = rest
                    .find(|c: char| !is_word_char(c))
                    .unwrap_or(rest.len());
                self.emit(TokenKind::Word, len)
            }
            (character, _) => self.emit(TokenKind::Symbol, character.len_utf8()),
        };

        Some(token)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<StatementKind> {
        split_statements(sql).iter().map(|s| s.kind).collect()
    }

    fn texts(sql: &str) -> Vec<&str> {
        split_statements(sql).iter().map(|s| s.text).collect()
    }

    fn assert_tiles(sql: &str) {
        let statements = split_statements(sql);
        let mut expected_start = 0;
        for statement in &statements {
            assert_eq!(statement.span.start, expected_start, "gap before {:?}", statement.text);
            assert!(!statement.text.is_empty());
            assert_eq!(statement.text, statement.text.trim());
            expected_start = statement.span.end;
        }
        if !statements.is_empty() {
            assert_eq!(expected_start, sql.len());
        }
    }

    #[test]
    fn test_split_counts_statements() {
        assert_eq!(texts("SELECT 1; SELECT 2;SELECT 3"), vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
        assert_eq!(texts("SELECT 1;"), vec!["SELECT 1"]);
        assert_eq!(texts("SELECT 1;;  ;\n"), vec!["SELECT 1"]);
        assert!(split_statements("  -- nothing here\n").is_empty());
        assert!(split_statements("").is_empty());
    }

    #[test]
    fn test_spans_tile_input() {
        for sql in [
            "SELECT 1; SELECT 2",
            "  SELECT 1 ;\n\n SELECT 2;  -- trailing\n",
            "-- leading\nSELECT 1;;DELETE FROM t;",
            "SELECT ';' ; SELECT \"a;b\" FROM t",
        ] {
            assert_tiles(sql);
        }
    }

    #[test]
    fn test_semicolons_inside_literals_and_comments() {
        assert_eq!(texts("SELECT 'a;b'; SELECT 2").len(), 2);
        assert_eq!(texts("SELECT 'it''s;' AS x").len(), 1);
        assert_eq!(texts("SELECT \"odd;name\" FROM t").len(), 1);
        assert_eq!(texts("SELECT 1 -- ; not a separator\n, 2").len(), 1);
        assert_eq!(texts("SELECT /* ; /* nested ; */ still */ 1").len(), 1);
        assert_eq!(texts("SELECT E'\\';' ; SELECT 2").len(), 2);
        assert_eq!(
            texts("CREATE FUNCTION f() RETURNS int AS $body$ BEGIN; RETURN 1; END; $body$ LANGUAGE plpgsql; SELECT f()"),
            vec![
                "CREATE FUNCTION f() RETURNS int AS $body$ BEGIN; RETURN 1; END; $body$ LANGUAGE plpgsql",
                "SELECT f()"
            ]
        );
        assert_eq!(texts("DO $$ BEGIN; END $$; SELECT 1").len(), 2);
    }

    #[test]
    fn test_positional_parameters_are_not_dollar_quotes() {
        assert_eq!(texts("SELECT $1; SELECT $2").len(), 2);
    }

    #[test]
    fn test_unterminated_input_is_unknown() {
        assert_eq!(kinds("DELETE FROM t WHERE a = 'oops"), vec![StatementKind::Unknown]);
        assert_eq!(kinds("SELECT 1; DROP /* never closed"), vec![StatementKind::Select, StatementKind::Unknown]);
    }

    #[test]
    fn test_leading_keyword() {
        assert_eq!(kinds("-- hello\n/* there */ DELETE FROM t"), vec![StatementKind::Delete]);
        assert_eq!(kinds("(SELECT 1) UNION (SELECT 2)"), vec![StatementKind::Select]);
        assert_eq!(kinds("+"), vec![StatementKind::Unknown]);
        assert_eq!(kinds("SELECT * INTO backup FROM t"), vec![StatementKind::Create]);
        assert_eq!(
            kinds("WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone"),
            vec![StatementKind::Delete]
        );
    }

    #[test]
    fn test_lexical_order_by() {
        assert!(has_order_by("select * from t order\n  by a desc"));
        assert!(!has_order_by("SELECT row_number() OVER (ORDER BY a) FROM t"));
        assert!(!has_order_by("SELECT 'ORDER BY' FROM t -- ORDER BY a"));
        assert!(!has_order_by("SELECT \"order\", by FROM t"));
    }
}
