//! SQL fragments for dynamically named tables and key columns.
//!
//! Identifiers are always double-quoted; values always go through bind
//! parameters.

/// Quote a single identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`schema.table`)
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Row expression over the key columns: `("a", "b")`, or `"a"` for one column
pub fn key_tuple(columns: &[String]) -> String {
    match columns {
        [single] => quote_ident(single),
        many => format!(
            "({})",
            many.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Key columns cast to bigint and collected into an array, for decoding as a cursor
pub fn key_array(columns: &[String]) -> String {
    format!(
        "ARRAY[{}]",
        columns
            .iter()
            .map(|c| format!("{}::bigint", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Bind placeholders `$start .. $start + count - 1` shaped like `key_tuple`
pub fn placeholders(start: usize, count: usize) -> String {
    let params: Vec<String> = (start..start + count).map(|i| format!("${}", i)).collect();
    if count == 1 {
        params.join("")
    } else {
        format!("({})", params.join(", "))
    }
}

/// `ORDER BY` list over the key columns
pub fn order_by(columns: &[String], descending: bool) -> String {
    let direction = if descending { " DESC" } else { "" };
    columns
        .iter()
        .map(|c| format!("{}{}", quote_ident(c), direction))
        .collect::<Vec<_>>()
        .join(", ")
}
