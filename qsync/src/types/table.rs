use pg_escape::quote_identifier;
use std::fmt;

/// Schema assumed for table names given without one.
pub const DEFAULT_SCHEMA: &str = "public";

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: String, name: String) -> TableName {
        Self { schema, name }
    }

    /// Parses a possibly unqualified name, defaulting to [`DEFAULT_SCHEMA`].
    ///
    /// Only the first dot separates schema and table, matching how names are stored in
    /// the replication catalog.
    pub fn parse(name: &str) -> TableName {
        match name.split_once('.') {
            Some((schema, name)) => Self::new(schema.to_owned(), name.to_owned()),
            None => Self::new(DEFAULT_SCHEMA.to_owned(), name.to_owned()),
        }
    }

    /// Returns the name quoted for use in SQL.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unqualified_names_get_default_schema() {
        let name = TableName::parse("accounts");
        assert_eq!(name.schema, "public");
        assert_eq!(name.name, "accounts");
        assert_eq!(name.to_string(), "public.accounts");
    }

    #[test]
    fn test_qualified_names_are_split_on_first_dot() {
        let name = TableName::parse("billing.invoices");
        assert_eq!(name, TableName::new("billing".into(), "invoices".into()));

        let name = TableName::parse("billing.invoices.v2");
        assert_eq!(name.schema, "billing");
        assert_eq!(name.name, "invoices.v2");
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            TableName::parse("public.accounts").as_quoted_identifier(),
            "public.accounts"
        );
        assert_eq!(
            TableName::parse("Billing.order items").as_quoted_identifier(),
            "\"Billing\".\"order items\""
        );
    }
}
