#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("'{field}' must be a positive integer, got '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("'{present}' requires '{missing}'")]
    MissingPair {
        present: &'static str,
        missing: &'static str,
    },
    #[error("cannot sort by '{0}'")]
    UnknownSortColumn(String),
    #[error("unknown sort order '{0}'")]
    UnknownOrder(String),
    #[error("'order' requires 'sort_by'")]
    OrderWithoutSort,
}

/// Raw query string of the table endpoint.
#[derive(Debug, Default, serde::Deserialize)]
pub struct TableParams {
    pub q: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Name,
    Downloads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u64,
    pub per_page: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub pattern: Option<String>,
    pub sort: Option<(SortColumn, SortOrder)>,
    pub page: Option<Page>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TableMeta {
    pub total_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableRow {
    pub name: String,
    pub downloads: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePage {
    pub meta: TableMeta,
    pub rows: Vec<TableRow>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_positive(field: &'static str, value: &str) -> Result<u64, QueryError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(QueryError::InvalidNumber {
            field,
            value: value.to_owned(),
        }),
    }
}

impl TryFrom<TableParams> for TableQuery {
    type Error = QueryError;

    fn try_from(params: TableParams) -> Result<Self, Self::Error> {
        let pattern = non_empty(params.q).map(|q| prefix_pattern(&q));

        let sort = match (non_empty(params.sort_by), non_empty(params.order)) {
            (None, None) => None,
            (None, Some(_)) => return Err(QueryError::OrderWithoutSort),
            (Some(column), order) => {
                let column = match column.as_str() {
                    "name" => SortColumn::Name,
                    "downloads" => SortColumn::Downloads,
                    _ => return Err(QueryError::UnknownSortColumn(column)),
                };
                let order = match order.as_deref() {
                    None | Some("asc") => SortOrder::Asc,
                    Some("desc") => SortOrder::Desc,
                    Some(other) => return Err(QueryError::UnknownOrder(other.to_owned())),
                };
                Some((column, order))
            }
        };

        let page = match (non_empty(params.page), non_empty(params.per_page)) {
            (None, None) => None,
            (Some(_), None) => {
                return Err(QueryError::MissingPair {
                    present: "page",
                    missing: "per_page",
                });
            }
            (None, Some(_)) => {
                return Err(QueryError::MissingPair {
                    present: "per_page",
                    missing: "page",
                });
            }
            (Some(page), Some(per_page)) => Some(Page {
                number: parse_positive("page", &page)?,
                per_page: parse_positive("per_page", &per_page)?,
            }),
        };

        Ok(Self {
            pattern,
            sort,
            page,
        })
    }
}

/// Translates a shell-style glob prefix into an SQLite GLOB pattern with a trailing `*`.
///
/// `[!..]` becomes `[^..]`, `\c` matches `c` literally and an unterminated `[` is literal.
pub fn prefix_pattern(prefix: &str) -> String {
    let chars: Vec<char> = prefix.chars().collect();
    let mut out = String::with_capacity(prefix.len() + 1);
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                push_literal(&mut out, chars[i + 1]);
                i += 2;
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    let body = &chars[i + 1..end];
                    i = end + 1;
                    match body {
                        // a leading '^' is literal in shell globs but negates in SQLite
                        ['^'] => out.push('^'),
                        ['^', rest @ ..] => {
                            out.push('[');
                            out.extend(rest);
                            out.push_str("^]");
                        }
                        ['!', rest @ ..] => {
                            out.push_str("[^");
                            out.extend(rest);
                            out.push(']');
                        }
                        _ => {
                            out.push('[');
                            out.extend(body);
                            out.push(']');
                        }
                    }
                }
                None => {
                    push_literal(&mut out, '[');
                    i += 1;
                }
            },
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out.push('*');
    out
}

fn push_literal(out: &mut String, c: char) {
    match c {
        '*' | '?' | '[' => {
            out.push('[');
            out.push(c);
            out.push(']');
        }
        _ => out.push(c),
    }
}

/// Index of the `]` closing the class opened at `start`, if any.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    chars[j.min(chars.len())..]
        .iter()
        .position(|&c| c == ']')
        .map(|p| j + p)
}

impl TableQuery {
    fn order_clause(&self) -> &'static str {
        match self.sort {
            None | Some((SortColumn::Name, SortOrder::Asc)) => "ORDER BY name ASC",
            Some((SortColumn::Name, SortOrder::Desc)) => "ORDER BY name DESC",
            Some((SortColumn::Downloads, SortOrder::Asc)) => "ORDER BY downloads ASC, name ASC",
            Some((SortColumn::Downloads, SortOrder::Desc)) => "ORDER BY downloads DESC, name ASC",
        }
    }

    /// Counts and fetches the requested slice in one snapshot. A page past the end is
    /// answered with page 1 instead of an error.
    pub fn run(
        &self,
        store: &crate::store::IndexStore,
        root_key: &str,
    ) -> rusqlite::Result<TablePage> {
        let pattern = self.pattern.as_deref().unwrap_or("*");

        store.snapshot(|tx| {
            let total: i64 = tx.query_row(
                "SELECT COUNT(*) FROM entries WHERE root_key = ?1 AND present = 1 AND name GLOB ?2",
                rusqlite::params![root_key, pattern],
                |row| row.get(0),
            )?;
            let total = total as u64;

            let mut meta = TableMeta {
                total_entries: total,
                page: None,
                per_page: None,
            };
            let (limit, offset) = match self.page {
                None => (-1_i64, 0_i64),
                Some(page) => {
                    let mut number = page.number;
                    let mut offset = (number - 1).saturating_mul(page.per_page);
                    if offset >= total {
                        crate::log_debug!(
                            "Page {} of {} is out of bounds for {} entries, serving page 1",
                            number,
                            page.per_page,
                            total
                        );
                        number = 1;
                        offset = 0;
                    }
                    meta.page = Some(number);
                    meta.per_page = Some(page.per_page);
                    (
                        i64::try_from(page.per_page).unwrap_or(i64::MAX),
                        i64::try_from(offset).unwrap_or(i64::MAX),
                    )
                }
            };

            let sql = format!(
                "SELECT name, downloads FROM entries
                 WHERE root_key = ?1 AND present = 1 AND name GLOB ?2
                 {} LIMIT ?3 OFFSET ?4",
                self.order_clause()
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![root_key, pattern, limit, offset],
                |row| {
                    Ok(TableRow {
                        name: row.get(0)?,
                        downloads: row.get::<_, i64>(1)? as u64,
                    })
                },
            )?;
            let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(TablePage { meta, rows })
        })
    }
}
