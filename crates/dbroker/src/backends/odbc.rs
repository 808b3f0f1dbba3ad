//! 🗄️ The ODBC backend: no cursors, no tokens, just the same statement with a new window.
//!
//! Every page re-submits a freshly built statement. Two ways to cut the window:
//!
//! - [`PagingStrategy::LimitOffset`]: `<base> LIMIT <page_size> OFFSET <offset>`.
//! - [`PagingStrategy::RowNumberWindow`]: for the databases that never heard of LIMIT, the
//!   base statement gets wrapped in a `ROW_NUMBER()` query and filtered to
//!   `(offset, offset + page_size]`.
//!
//! A page with zero rows ends the sequence. Columns come from the result descriptor and get
//! zipped with each row, so a record reads in column-declaration order.
//!
//! 🔌 The native handle is the [`OdbcConnection`] trait. Driver bindings implement it outside
//! this crate. ⚠️ Statement text is built by string formatting; identifiers and the base
//! statement are trusted, the way the caller wrote them.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::backends::Pager;
use crate::common::{BackendKind, Record, WriteSummary};
use crate::error::BrokerError;

/// 📋 What a statement hands back: the result descriptor plus the rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// 🔌 The driver interface. Connection construction is somebody else's problem.
#[async_trait]
pub trait OdbcConnection: std::fmt::Debug + Send + Sync {
    /// 📡 Execute one statement and fetch everything it returns.
    async fn execute(&self, statement: &str) -> Result<ResultSet>;

    /// ✍️ Execute one parameterized statement over many parameter rows (`executemany`).
    /// Returns the number of affected rows.
    async fn execute_batch(&self, statement: &str, parameters: Vec<Vec<Value>>) -> Result<u64>;

    async fn commit(&self) -> Result<()>;
}

/// ✂️ How to cut the next window out of the base statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStrategy {
    LimitOffset,
    RowNumberWindow,
}

impl PagingStrategy {
    pub fn from_use_limit_offset(use_limit_offset: bool) -> Self {
        if use_limit_offset {
            PagingStrategy::LimitOffset
        } else {
            PagingStrategy::RowNumberWindow
        }
    }
}

/// 🏗️ Builds the statement for one page. Trailing `;` and whitespace on the base are trimmed,
/// otherwise the suffix lands after the terminator and the database gets upset.
pub(crate) fn paged_statement(
    base_query: &str,
    strategy: PagingStrategy,
    page_size: usize,
    offset: u64,
) -> String {
    let base = base_query.trim().trim_end_matches(';').trim_end();
    match strategy {
        PagingStrategy::LimitOffset => format!("{base} LIMIT {page_size} OFFSET {offset}"),
        PagingStrategy::RowNumberWindow => format!(
            "SELECT * FROM (SELECT ROW_NUMBER() OVER (ORDER BY 1) AS rownum, * FROM ({base}) AS inner_query) AS outer_query WHERE rownum > {offset} AND rownum <= {upper}",
            upper = offset + page_size as u64
        ),
    }
}

/// 📄 The offset is the continuation state. It only ever goes up.
#[derive(Debug)]
pub(crate) struct OdbcPager {
    connection: Arc<dyn OdbcConnection>,
    base_query: String,
    strategy: PagingStrategy,
    page_size: usize,
    offset: u64,
    exhausted: bool,
}

impl OdbcPager {
    pub(crate) fn new(
        connection: Arc<dyn OdbcConnection>,
        base_query: String,
        strategy: PagingStrategy,
        page_size: usize,
        offset: u64,
    ) -> Self {
        Self {
            connection,
            base_query,
            strategy,
            page_size,
            offset,
            exhausted: false,
        }
    }
}

#[async_trait]
impl Pager for OdbcPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        if self.exhausted {
            return Ok(None);
        }

        let statement =
            paged_statement(&self.base_query, self.strategy, self.page_size, self.offset);
        let offset = self.offset;
        trace!("🗄️ executing page statement at offset {}: {}", offset, statement);
        let result = self
            .connection
            .execute(&statement)
            .await
            .with_context(|| format!("💀 The page statement at offset {offset} failed to execute"))?;

        if result.rows.is_empty() {
            debug!("✅ odbc window at offset {} came back empty, done", self.offset);
            self.exhausted = true;
            return Ok(None);
        }

        let records = zip_rows(result)?;
        debug!("📦 odbc page at offset {}: {} rows", self.offset, records.len());
        self.offset += self.page_size as u64;
        if records.len() < self.page_size {
            // -- a short window is the last one
            self.exhausted = true;
        }
        Ok(Some(records))
    }

    async fn release(&mut self) -> Result<()> {
        // -- nothing held server-side. the statement is gone the moment it returns.
        self.exhausted = true;
        Ok(())
    }
}

// -- 🤐 columns x values, one record per row, declaration order preserved
fn zip_rows(result: ResultSet) -> Result<Vec<Record>> {
    let ResultSet { columns, rows } = result;
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != columns.len() {
                return Err(BrokerError::MalformedResponse {
                    backend: BackendKind::Odbc,
                    detail: format!(
                        "row {i} has {} values but the descriptor declares {} columns",
                        row.len(),
                        columns.len()
                    ),
                }
                .into());
            }
            Ok(columns.iter().cloned().zip(row).collect())
        })
        .collect()
}

/// 📐 Every record must carry exactly the first record's column set. Checked up front,
/// before the driver sees a single byte.
pub(crate) fn shared_columns(records: &[Record]) -> Result<Vec<String>, BrokerError> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let columns = first.field_names();
    let expected: BTreeSet<&String> = columns.iter().collect();

    for (position, record) in records.iter().enumerate().skip(1) {
        let found: BTreeSet<&String> = record.keys().collect();
        if found != expected {
            return Err(BrokerError::InconsistentColumns {
                position,
                expected: columns.clone(),
                found: record.field_names(),
            });
        }
    }
    Ok(columns)
}

pub(crate) fn insert_statement(table: &str, columns: &[String]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

/// ✍️ One parameterized insert over every row, then commit. Empty input: no-op.
pub(crate) async fn bulk_insert(
    connection: &dyn OdbcConnection,
    table: &str,
    records: Vec<Record>,
) -> Result<WriteSummary> {
    if records.is_empty() {
        return Ok(WriteSummary::empty(BackendKind::Odbc));
    }

    let columns = shared_columns(&records)?;
    let statement = insert_statement(table, &columns);
    let submitted = records.len();
    let parameters: Vec<Vec<Value>> = records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|column| record.remove(column).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    trace!("🗄️ {} x {}", submitted, statement);
    let affected = connection
        .execute_batch(&statement, parameters)
        .await
        .with_context(|| format!("💀 Bulk insert into '{table}' failed to execute"))?;
    connection
        .commit()
        .await
        .with_context(|| format!("💀 Bulk insert into '{table}' executed but the commit failed"))?;

    debug!("✅ {} rows committed into {}", affected, table);
    Ok(WriteSummary {
        backend: BackendKind::Odbc,
        submitted,
        written: usize::try_from(affected).unwrap_or(submitted),
        failures: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryOdbc;
    use serde_json::json;

    fn employees(n: usize) -> Arc<InMemoryOdbc> {
        let rows = (1..=n)
            .map(|i| vec![json!(i), json!(format!("emp-{i}")), json!(1000 * i)])
            .collect();
        Arc::new(InMemoryOdbc::new(
            vec!["id".into(), "name".into(), "salary".into()],
            rows,
        ))
    }

    #[test]
    fn the_one_where_both_windows_are_cut_correctly() {
        assert_eq!(
            paged_statement("SELECT * FROM employees;", PagingStrategy::LimitOffset, 10, 20),
            "SELECT * FROM employees LIMIT 10 OFFSET 20"
        );
        let windowed =
            paged_statement("SELECT * FROM employees", PagingStrategy::RowNumberWindow, 10, 20);
        assert!(windowed.contains("FROM (SELECT * FROM employees) AS inner_query"));
        assert!(windowed.ends_with("WHERE rownum > 20 AND rownum <= 30"));
    }

    #[tokio::test]
    async fn the_one_where_twenty_five_rows_take_three_fetches() -> Result<()> {
        let odbc = employees(25);
        let mut pager = OdbcPager::new(
            odbc.clone(),
            "SELECT * FROM employees".into(),
            PagingStrategy::LimitOffset,
            10,
            0,
        );

        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().await? {
            assert_eq!(page[0].field_names(), vec!["id", "name", "salary"]);
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(
            odbc.executed().await.len(),
            3,
            "the short page ends it, no trailing empty fetch"
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_exact_multiple_takes_one_extra_empty_fetch() -> Result<()> {
        let odbc = employees(20);
        let mut pager = OdbcPager::new(
            odbc.clone(),
            "SELECT * FROM employees".into(),
            PagingStrategy::LimitOffset,
            10,
            0,
        );
        let mut total = 0;
        while let Some(page) = pager.next_page().await? {
            total += page.len();
        }
        assert_eq!(total, 20);
        let executed = odbc.executed().await;
        assert_eq!(executed.len(), 3);
        assert!(executed[2].ends_with("LIMIT 10 OFFSET 20"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_row_number_window_walks_the_table() -> Result<()> {
        let odbc = employees(7);
        let mut pager = OdbcPager::new(
            odbc.clone(),
            "SELECT * FROM employees".into(),
            PagingStrategy::RowNumberWindow,
            3,
            0,
        );
        let mut ids = Vec::new();
        while let Some(page) = pager.next_page().await? {
            for record in page {
                assert_eq!(record.field_names()[0], "rownum");
                ids.push(record["id"].clone());
            }
        }
        assert_eq!(ids, (1..=7).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(odbc.executed().await.len(), 3, "3 + 3 + 1, the short window is the last");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_starting_offset_skips_ahead() -> Result<()> {
        let odbc = employees(5);
        let mut pager = OdbcPager::new(
            odbc,
            "SELECT * FROM employees".into(),
            PagingStrategy::LimitOffset,
            10,
            3,
        );
        let page = pager.next_page().await?.expect("💀 two rows remain past offset 3");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["id"], json!(4));
        Ok(())
    }

    #[test]
    fn the_one_where_mismatched_columns_are_caught_before_the_driver() {
        let records = vec![
            Record::new().with("a", 1).with("b", 2),
            Record::new().with("b", 3).with("a", 4),
            Record::new().with("a", 5).with("c", 6),
        ];
        let err = shared_columns(&records).unwrap_err();
        match err {
            BrokerError::InconsistentColumns { position, expected, found } => {
                assert_eq!(position, 2);
                assert_eq!(expected, vec!["a", "b"]);
                assert_eq!(found, vec!["a", "c"]);
            }
            other => panic!("💀 expected InconsistentColumns, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_rows_are_inserted_in_one_batch_then_committed() -> Result<()> {
        let odbc = employees(0);
        let records = vec![
            Record::new().with("id", 1).with("name", "ada").with("salary", 10),
            Record::new().with("salary", 20).with("name", "grace").with("id", 2),
        ];
        let summary = bulk_insert(odbc.as_ref(), "employees", records).await?;
        assert!(summary.is_clean());
        assert_eq!(summary.written, 2);

        let batches = odbc.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "INSERT INTO employees (id, name, salary) VALUES (?, ?, ?)");
        // -- second record's values follow the first record's column order, not its own
        assert_eq!(batches[0].1[1], vec![json!(2), json!("grace"), json!(20)]);
        assert_eq!(odbc.commits(), 1);
        assert_eq!(odbc.row_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bad_shapes_never_reach_the_driver() {
        let odbc = employees(0);
        let records = vec![Record::new().with("id", 1), Record::new().with("nope", 2)];
        let err = bulk_insert(odbc.as_ref(), "employees", records).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BrokerError>(),
            Some(BrokerError::InconsistentColumns { .. })
        ));
        assert!(odbc.batches().await.is_empty());
        assert_eq!(odbc.commits(), 0);
    }
}
