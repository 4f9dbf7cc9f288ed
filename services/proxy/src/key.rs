//! Batching key inspection
//!
//! The batching key is the request target exactly as received. These helpers
//! only read it; the key itself is never rewritten.

/// How appended payloads are joined inside one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFormat {
    /// `VALUES` tuples joined by the row delimiter, one row per append
    Values,
    /// Newline-separated rows (`FORMAT TSV`, `FORMAT JSONEachRow`, ...)
    LineOriented,
}

impl BatchFormat {
    /// Line-oriented iff the decoded query has a `FORMAT <name>` clause
    /// whose name is not `Values`
    pub fn detect(key: &str) -> Self {
        let Some(query) = decoded_query(key) else {
            return Self::Values;
        };

        let mut tokens = query.split_whitespace();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("FORMAT") {
                return match tokens.next() {
                    Some(name) if !name.eq_ignore_ascii_case("Values") => Self::LineOriented,
                    _ => Self::Values,
                };
            }
        }
        Self::Values
    }

    pub fn is_line_oriented(&self) -> bool {
        matches!(self, Self::LineOriented)
    }
}

/// Value of the `query` parameter, percent-decoded
pub fn decoded_query(key: &str) -> Option<String> {
    let (_, raw) = key.split_once('?')?;
    url::form_urlencoded::parse(raw.as_bytes())
        .find(|(name, _)| name == "query")
        .map(|(_, value)| value.into_owned())
}

/// Whether the key carries an `INSERT` statement
pub fn is_insert(key: &str) -> bool {
    decoded_query(key)
        .map(|query| {
            query
                .trim_start()
                .get(..6)
                .is_some_and(|verb| verb.eq_ignore_ascii_case("INSERT"))
        })
        .unwrap_or(false)
}
