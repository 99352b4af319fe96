//! SQL dialects: placeholders, identifier quoting and paging syntax.

use serde::{Deserialize, Serialize};

/// SQL dialect for generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// SQL Server dialect (uses @p1, @p2 placeholders)
    #[serde(rename = "sqlserver")]
    SqlServer,
}

/// How a dialect renders a paging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStyle {
    /// `LIMIT n OFFSET m` after ORDER BY
    LimitOffset,
    /// `OFFSET m ROWS FETCH NEXT n ROWS ONLY` after ORDER BY, `TOP (n)` for top-N
    OffsetFetch,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
            Dialect::SqlServer => format!("@p{index}"),
        }
    }

    /// Opening and closing identifier quote characters.
    pub const fn quote_chars(self) -> (char, char) {
        match self {
            Dialect::Postgres | Dialect::Sqlite => ('"', '"'),
            Dialect::Mysql => ('`', '`'),
            Dialect::SqlServer => ('[', ']'),
        }
    }

    /// Quote an identifier, doubling any embedded closing quote character.
    pub fn safe_id(self, name: &str) -> String {
        let (open, close) = self.quote_chars();
        let mut out = String::with_capacity(name.len() + 2);
        out.push(open);
        for c in name.chars() {
            out.push(c);
            if c == close {
                out.push(c);
            }
        }
        out.push(close);
        out
    }

    /// Reverse [`safe_id`](Self::safe_id). Unquoted input is returned unchanged.
    pub fn unescape_id(self, quoted: &str) -> String {
        let (open, close) = self.quote_chars();
        let inner = quoted
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close));
        let Some(inner) = inner else {
            return quoted.to_string();
        };
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            out.push(c);
            if c == close && chars.peek() == Some(&close) {
                chars.next();
            }
        }
        out
    }

    /// Quote a possibly schema-qualified table name.
    pub fn table_name(self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.safe_id(schema), self.safe_id(table)),
            None => self.safe_id(table),
        }
    }

    pub const fn paging_style(self) -> PagingStyle {
        match self {
            Dialect::SqlServer => PagingStyle::OffsetFetch,
            Dialect::Postgres | Dialect::Sqlite | Dialect::Mysql => PagingStyle::LimitOffset,
        }
    }

    /// How an insert reports a storage-assigned identity.
    pub const fn identity_return(self) -> IdentityReturn {
        match self {
            Dialect::Postgres | Dialect::Sqlite => IdentityReturn::Returning,
            Dialect::SqlServer => IdentityReturn::Output,
            Dialect::Mysql => IdentityReturn::LastInsertId,
        }
    }
}

/// Identity retrieval strategy for auto-numbered inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityReturn {
    /// `INSERT … RETURNING id`
    Returning,
    /// `INSERT … OUTPUT INSERTED.id VALUES …`
    Output,
    /// Driver-reported last insert id
    LastInsertId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Dialect; 4] = [
        Dialect::Postgres,
        Dialect::Sqlite,
        Dialect::Mysql,
        Dialect::SqlServer,
    ];

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?3");
        assert_eq!(Dialect::Mysql.placeholder(3), "?");
        assert_eq!(Dialect::SqlServer.placeholder(3), "@p3");
    }

    #[test]
    fn test_safe_id_escapes_close_quote() {
        assert_eq!(Dialect::Postgres.safe_id("user\"name"), "\"user\"\"name\"");
        assert_eq!(Dialect::Mysql.safe_id("user`name"), "`user``name`");
        assert_eq!(Dialect::SqlServer.safe_id("a]b"), "[a]]b]");
        assert_eq!(Dialect::SqlServer.safe_id("a[b"), "[a[b]");
    }

    #[test]
    fn test_table_name_with_schema() {
        assert_eq!(
            Dialect::Postgres.table_name(Some("billing"), "invoices"),
            "\"billing\".\"invoices\""
        );
        assert_eq!(Dialect::SqlServer.table_name(None, "invoices"), "[invoices]");
    }

    #[test]
    fn test_unescape_unquoted_passthrough() {
        assert_eq!(Dialect::Postgres.unescape_id("plain"), "plain");
    }

    #[test]
    fn test_dialect_config_names() {
        let d: Dialect = serde_json::from_str("\"sqlserver\"").unwrap();
        assert_eq!(d, Dialect::SqlServer);
        let d: Dialect = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(d, Dialect::Mysql);
    }

    proptest! {
        #[test]
        fn escape_round_trips(name in any::<String>()) {
            for dialect in ALL {
                prop_assert_eq!(dialect.unescape_id(&dialect.safe_id(&name)), name.clone());
            }
        }

        #[test]
        fn escape_round_trips_quote_heavy(name in "[a-z\"`\\[\\] ]{0,24}") {
            for dialect in ALL {
                prop_assert_eq!(dialect.unescape_id(&dialect.safe_id(&name)), name.clone());
            }
        }
    }
}
