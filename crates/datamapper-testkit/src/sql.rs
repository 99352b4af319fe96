//! Parser for the SQL subset the command generator emits.
//!
//! Covers single-table `SELECT` (column list, `COUNT(*)`, one aggregate),
//! `INSERT … VALUES`/`DEFAULT VALUES` with optional `RETURNING`, `UPDATE …
//! SET` and `DELETE`, with AND-ed conditions, `ORDER BY` and `LIMIT/OFFSET`.
//! Placeholders may be `$n`, `?n`, `@pn` or a bare positional `?`; they are
//! resolved against the bound parameters while parsing, so the statement
//! tree holds plain values.

use datamapper_core::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Word(String),
    Number(i64),
    Param(usize),
    Sym(&'static str),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut positional = 0;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' | '`' | '[' => {
                let close = match c {
                    '[' => ']',
                    other => other,
                };
                let mut name = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated identifier".to_string()),
                        Some(&ch) if ch == close => {
                            if chars.get(i + 1) == Some(&close) {
                                name.push(close);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            name.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '$' | '?' | '@' => {
                let mut start = i + 1;
                if c == '@' && chars.get(start) == Some(&'p') {
                    start += 1;
                }
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let index = if end == start && c == '?' {
                    positional += 1;
                    positional
                } else {
                    let digits: String = chars[start..end].iter().collect();
                    digits
                        .parse::<usize>()
                        .map_err(|_| format!("malformed placeholder at offset {i}"))?
                };
                tokens.push(Token::Param(index));
                i = end;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let n = digits.parse::<i64>().map_err(|e| e.to_string())?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            '<' | '>' => {
                let sym = match (c, chars.get(i + 1)) {
                    ('<', Some('=')) => "<=",
                    ('<', Some('>')) => "<>",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    _ => ">",
                };
                i += sym.len();
                tokens.push(Token::Sym(sym));
            }
            '(' => {
                tokens.push(Token::Sym("("));
                i += 1;
            }
            ')' => {
                tokens.push(Token::Sym(")"));
                i += 1;
            }
            ',' => {
                tokens.push(Token::Sym(","));
                i += 1;
            }
            '.' => {
                tokens.push(Token::Sym("."));
                i += 1;
            }
            '=' => {
                tokens.push(Token::Sym("="));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Sym("*"));
                i += 1;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// Comparison in a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Condition {
    Const(bool),
    IsNull { column: String, negated: bool },
    Compare { column: String, cmp: Cmp, value: Value },
    Like { column: String, pattern: String, negated: bool },
    In { column: String, values: Vec<Value>, negated: bool },
    InSelect { column: String, sub: Box<SubSelect>, negated: bool },
}

/// `SELECT column FROM table WHERE …` inside an `IN (…)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubSelect {
    pub column: String,
    pub table: String,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    Columns(Vec<String>),
    CountAll,
    Aggregate(Aggregate, String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Select {
        projection: Projection,
        table: String,
        conditions: Vec<Condition>,
        order: Vec<(String, bool)>,
        limit: Option<usize>,
        offset: usize,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        returning: Option<String>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
}

/// Parse one statement, binding `params` into it.
pub(crate) fn parse(sql: &str, params: &[Value]) -> Result<Statement, String> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params,
    };
    let statement = parser.statement()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("trailing input at token {}", parser.pos));
    }
    Ok(statement)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of statement".to_string())?;
        self.pos += 1;
        Ok(token)
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn is_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == sym)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        let found = self.is_word(word);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        let found = self.is_sym(sym);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_word(&mut self, word: &str) -> Result<(), String> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(format!("expected {word}, found {:?}", self.peek()))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), String> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected '{sym}', found {:?}", self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    /// `"alias"."column"` or `"column"`; the alias is dropped.
    fn column(&mut self) -> Result<String, String> {
        let first = self.ident()?;
        if self.eat_sym(".") {
            return self.ident();
        }
        Ok(first)
    }

    /// `"schema"."table"` or `"table"`, with an optional `AS "alias"`.
    fn table(&mut self) -> Result<String, String> {
        let mut name = self.ident()?;
        if self.eat_sym(".") {
            name = format!("{name}.{}", self.ident()?);
        }
        if self.eat_word("AS") {
            self.ident()?;
        }
        Ok(name)
    }

    fn value(&mut self) -> Result<Value, String> {
        match self.next()? {
            Token::Param(index) => index
                .checked_sub(1)
                .and_then(|i| self.params.get(i))
                .cloned()
                .ok_or_else(|| format!("placeholder {index} has no bound parameter")),
            Token::Number(n) => Ok(Value::BigInt(n)),
            Token::Word(w) if w == "NULL" => Ok(Value::Null),
            Token::Word(w) if w == "TRUE" => Ok(Value::Bool(true)),
            Token::Word(w) if w == "FALSE" => Ok(Value::Bool(false)),
            other => Err(format!("expected a value, found {other:?}")),
        }
    }

    fn count(&mut self) -> Result<usize, String> {
        let value = self.value()?;
        value
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| format!("expected a row count, found {value:?}"))
    }

    fn statement(&mut self) -> Result<Statement, String> {
        match self.next()? {
            Token::Word(w) if w == "SELECT" => self.select(),
            Token::Word(w) if w == "INSERT" => self.insert(),
            Token::Word(w) if w == "UPDATE" => self.update(),
            Token::Word(w) if w == "DELETE" => {
                self.expect_word("FROM")?;
                let table = self.table()?;
                let conditions = self.where_clause()?;
                Ok(Statement::Delete { table, conditions })
            }
            other => Err(format!("unsupported statement starting with {other:?}")),
        }
    }

    fn select(&mut self) -> Result<Statement, String> {
        let mut limit = None;
        if self.eat_word("TOP") {
            self.expect_sym("(")?;
            limit = Some(self.count()?);
            self.expect_sym(")")?;
        }
        let projection = self.projection()?;
        self.expect_word("FROM")?;
        let table = self.table()?;
        let conditions = self.where_clause()?;

        let mut order = Vec::new();
        if self.eat_word("ORDER") {
            self.expect_word("BY")?;
            loop {
                let column = self.column()?;
                let descending = if self.eat_word("DESC") {
                    true
                } else {
                    self.eat_word("ASC");
                    false
                };
                order.push((column, descending));
                if !self.eat_sym(",") {
                    break;
                }
            }
        }

        let mut offset = 0;
        if self.eat_word("LIMIT") {
            limit = Some(self.count()?);
        }
        if self.eat_word("OFFSET") {
            offset = self.count()?;
            if self.eat_word("ROWS") {
                self.expect_word("FETCH")?;
                self.expect_word("NEXT")?;
                limit = Some(self.count()?);
                self.expect_word("ROWS")?;
                self.expect_word("ONLY")?;
            }
        }
        Ok(Statement::Select {
            projection,
            table,
            conditions,
            order,
            limit,
            offset,
        })
    }

    fn projection(&mut self) -> Result<Projection, String> {
        let function = match self.peek() {
            Some(Token::Word(w)) => match w.as_str() {
                "COUNT" => Some(Aggregate::Count),
                "SUM" => Some(Aggregate::Sum),
                "AVG" => Some(Aggregate::Avg),
                "MIN" => Some(Aggregate::Min),
                "MAX" => Some(Aggregate::Max),
                _ => None,
            },
            _ => None,
        };
        if let Some(function) = function {
            self.pos += 1;
            self.expect_sym("(")?;
            if function == Aggregate::Count && self.eat_sym("*") {
                self.expect_sym(")")?;
                return Ok(Projection::CountAll);
            }
            let column = self.column()?;
            self.expect_sym(")")?;
            return Ok(Projection::Aggregate(function, column));
        }
        let mut columns = vec![self.column()?];
        while self.eat_sym(",") {
            columns.push(self.column()?);
        }
        Ok(Projection::Columns(columns))
    }

    fn insert(&mut self) -> Result<Statement, String> {
        self.expect_word("INTO")?;
        let table = self.table()?;
        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut returning = self.output_clause()?;
        if self.eat_word("DEFAULT") {
            self.expect_word("VALUES")?;
            rows.push(Vec::new());
        } else {
            self.expect_sym("(")?;
            if !self.is_sym(")") {
                columns.push(self.ident()?);
                while self.eat_sym(",") {
                    columns.push(self.ident()?);
                }
            }
            self.expect_sym(")")?;
            if returning.is_none() {
                returning = self.output_clause()?;
            }
            self.expect_word("VALUES")?;
            loop {
                self.expect_sym("(")?;
                let mut row = Vec::new();
                if !self.is_sym(")") {
                    row.push(self.value()?);
                    while self.eat_sym(",") {
                        row.push(self.value()?);
                    }
                }
                self.expect_sym(")")?;
                if row.len() != columns.len() {
                    return Err(format!(
                        "{} values for {} columns",
                        row.len(),
                        columns.len()
                    ));
                }
                rows.push(row);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        if self.eat_word("RETURNING") {
            returning = Some(self.ident()?);
        }
        Ok(Statement::Insert {
            table,
            columns,
            rows,
            returning,
        })
    }

    /// SQL Server's `OUTPUT INSERTED.column`.
    fn output_clause(&mut self) -> Result<Option<String>, String> {
        if !self.eat_word("OUTPUT") {
            return Ok(None);
        }
        self.expect_word("INSERTED")?;
        self.expect_sym(".")?;
        Ok(Some(self.ident()?))
    }

    fn update(&mut self) -> Result<Statement, String> {
        let table = self.table()?;
        self.expect_word("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident()?;
            self.expect_sym("=")?;
            assignments.push((column, self.value()?));
            if !self.eat_sym(",") {
                break;
            }
        }
        let conditions = self.where_clause()?;
        Ok(Statement::Update {
            table,
            assignments,
            conditions,
        })
    }

    fn where_clause(&mut self) -> Result<Vec<Condition>, String> {
        let mut conditions = Vec::new();
        if self.eat_word("WHERE") {
            conditions.push(self.condition()?);
            while self.eat_word("AND") {
                conditions.push(self.condition()?);
            }
        }
        Ok(conditions)
    }

    fn condition(&mut self) -> Result<Condition, String> {
        if let Some(Token::Number(left)) = self.peek().cloned() {
            self.pos += 1;
            self.expect_sym("=")?;
            let right = self.value()?;
            return Ok(Condition::Const(Value::BigInt(left).same_as(&right)));
        }
        let column = self.column()?;
        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            self.expect_word("NULL")?;
            return Ok(Condition::IsNull { column, negated });
        }
        let negated = self.eat_word("NOT");
        if self.eat_word("IN") {
            self.expect_sym("(")?;
            if self.eat_word("SELECT") {
                let sub_column = self.column()?;
                self.expect_word("FROM")?;
                let table = self.table()?;
                let conditions = self.where_clause()?;
                self.expect_sym(")")?;
                return Ok(Condition::InSelect {
                    column,
                    sub: Box::new(SubSelect {
                        column: sub_column,
                        table,
                        conditions,
                    }),
                    negated,
                });
            }
            let mut values = vec![self.value()?];
            while self.eat_sym(",") {
                values.push(self.value()?);
            }
            self.expect_sym(")")?;
            return Ok(Condition::In {
                column,
                values,
                negated,
            });
        }
        if self.eat_word("LIKE") {
            let pattern = match self.value()? {
                Value::Text(p) => p,
                other => return Err(format!("LIKE needs a text pattern, found {other:?}")),
            };
            return Ok(Condition::Like {
                column,
                pattern,
                negated,
            });
        }
        if negated {
            return Err("NOT must precede IN or LIKE".to_string());
        }
        let cmp = match self.next()? {
            Token::Sym("=") => Cmp::Eq,
            Token::Sym("<>") => Cmp::NotEq,
            Token::Sym("<") => Cmp::Lt,
            Token::Sym("<=") => Cmp::LtEq,
            Token::Sym(">") => Cmp::Gt,
            Token::Sym(">=") => Cmp::GtEq,
            other => return Err(format!("expected a comparison, found {other:?}")),
        };
        let value = self.value()?;
        Ok(Condition::Compare { column, cmp, value })
    }
}

/// SQL `LIKE` with `%` and `_` wildcards.
pub(crate) fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(&c) if c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paged_select() {
        let stmt = parse(
            r#"SELECT "i"."id", "i"."number" FROM "invoices" AS "i" WHERE "i"."total" > $1 AND "i"."kind" IN ($2, $3) ORDER BY "i"."total" DESC, "i"."id" ASC LIMIT $4 OFFSET $5"#,
            &[
                Value::Double(1.5),
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::BigInt(10),
                Value::BigInt(20),
            ],
        )
        .unwrap();
        let Statement::Select {
            projection,
            table,
            conditions,
            order,
            limit,
            offset,
        } = stmt
        else {
            panic!("expected a select");
        };
        assert_eq!(
            projection,
            Projection::Columns(vec!["id".into(), "number".into()])
        );
        assert_eq!(table, "invoices");
        assert_eq!(conditions.len(), 2);
        assert_eq!(order, vec![("total".into(), true), ("id".into(), false)]);
        assert_eq!(limit, Some(10));
        assert_eq!(offset, 20);
    }

    #[test]
    fn test_parse_many_to_many_subselect() {
        let stmt = parse(
            r#"SELECT "t"."id" FROM "tags" AS "t" WHERE "t"."id" IN (SELECT "tag_id" FROM "invoice_tags" WHERE "invoice_id" = $1)"#,
            &[Value::BigInt(7)],
        )
        .unwrap();
        let Statement::Select { conditions, .. } = stmt else {
            panic!("expected a select");
        };
        assert!(matches!(&conditions[0], Condition::InSelect { sub, .. } if sub.table == "invoice_tags"));
    }

    #[test]
    fn test_parse_insert_returning() {
        let stmt = parse(
            r#"INSERT INTO "invoices" ("number", "version") VALUES ($1, $2) RETURNING "id""#,
            &[Value::Text("A".into()), Value::BigInt(1)],
        )
        .unwrap();
        assert_eq!(
            stmt,
            Statement::Insert {
                table: "invoices".into(),
                columns: vec!["number".into(), "version".into()],
                rows: vec![vec![Value::Text("A".into()), Value::BigInt(1)]],
                returning: Some("id".into()),
            }
        );
    }

    #[test]
    fn test_missing_parameter_is_an_error() {
        let err = parse(r#"DELETE FROM "t" WHERE "id" = $2"#, &[Value::BigInt(1)]).unwrap_err();
        assert!(err.contains("placeholder 2"));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like("INV-001", "INV-%"));
        assert!(like("INV-001", "%-00_"));
        assert!(!like("INV-001", "X%"));
        assert!(like("", "%"));
    }
}
