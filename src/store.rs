/// Relative name the root directory itself is indexed under.
pub const ROOT_NAME: &str = ".";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        root_key  TEXT    NOT NULL,
        name      TEXT    NOT NULL,
        is_dir    INTEGER NOT NULL DEFAULT 0,
        present   INTEGER NOT NULL DEFAULT 1,
        downloads INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (root_key, name)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_entries_downloads ON entries (root_key, downloads);

    CREATE TABLE IF NOT EXISTS login (
        user     TEXT NOT NULL,
        password TEXT NOT NULL,
        PRIMARY KEY (user, password)
    ) WITHOUT ROWID;
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub present: usize,
    pub added: usize,
    pub removed: usize,
}

pub struct IndexStore {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl IndexStore {
    pub fn open(path: &std::path::Path, refresh_schema: bool) -> rusqlite::Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        if refresh_schema {
            crate::log_warn!("Dropping index and login tables in {:?}", path);
            conn.execute_batch(
                "DROP TABLE IF EXISTS entries;
                 DROP TABLE IF EXISTS login;",
            )?;
        }
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn from_connection(conn: rusqlite::Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        // Every write is transactional, so a panicked holder cannot leave partial state behind.
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Runs `f` inside one read transaction, giving it a consistent view of the tables.
    pub fn snapshot<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Makes the present rows of `root_key` exactly `observed`. Rows that were not observed
    /// are kept as absent so their download counts survive a later reappearance.
    pub fn reconcile(
        &self,
        root_key: &str,
        observed: &[ObservedEntry],
    ) -> rusqlite::Result<ReconcileReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let previously_present: std::collections::HashSet<String> = {
            let mut stmt =
                tx.prepare("SELECT name FROM entries WHERE root_key = ?1 AND present = 1")?;
            let names = stmt.query_map(rusqlite::params![root_key], |row| row.get(0))?;
            names.collect::<rusqlite::Result<_>>()?
        };

        tx.execute(
            "UPDATE entries SET present = 0 WHERE root_key = ?1",
            rusqlite::params![root_key],
        )?;

        let mut report = ReconcileReport::default();
        let mut still_present = 0;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO entries (root_key, name, is_dir, present, downloads)
                 VALUES (?1, ?2, ?3, 1, 0)",
            )?;
            let mut revive = tx.prepare(
                "UPDATE entries SET present = 1, is_dir = ?3 WHERE root_key = ?1 AND name = ?2",
            )?;
            for entry in observed {
                if insert.execute(rusqlite::params![root_key, entry.name, entry.is_dir])? > 0 {
                    report.added += 1;
                } else {
                    revive.execute(rusqlite::params![root_key, entry.name, entry.is_dir])?;
                    if previously_present.contains(&entry.name) {
                        still_present += 1;
                    }
                }
            }
        }

        tx.commit()?;

        report.present = observed.len();
        report.removed = previously_present.len() - still_present;
        Ok(report)
    }

    /// Kind of a present entry, `None` when it is unknown or no longer present.
    pub fn lookup(&self, root_key: &str, name: &str) -> rusqlite::Result<Option<EntryKind>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT is_dir FROM entries WHERE root_key = ?1 AND name = ?2 AND present = 1",
        )?;
        let mut rows = stmt.query(rusqlite::params![root_key, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(if row.get::<_, bool>(0)? {
                EntryKind::Directory
            } else {
                EntryKind::File
            })),
            None => Ok(None),
        }
    }

    /// Adds one download to a present file. Returns false when no such row exists anymore.
    pub fn record_download(&self, root_key: &str, name: &str) -> rusqlite::Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE entries SET downloads = downloads + 1
             WHERE root_key = ?1 AND name = ?2 AND present = 1 AND is_dir = 0",
            rusqlite::params![root_key, name],
        )?;
        Ok(changed == 1)
    }

    /// Present non-directory entries under `dir` (recursively), sorted by name.
    pub fn files_under(&self, root_key: &str, dir: &str) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name FROM entries
             WHERE root_key = ?1 AND present = 1 AND is_dir = 0
               AND (?2 = '.' OR substr(name, 1, length(?2) + 1) = ?2 || '/')
             ORDER BY name",
        )?;
        let names = stmt.query_map(rusqlite::params![root_key, dir], |row| row.get(0))?;
        names.collect()
    }

    pub fn check_credentials(&self, user: &str, password: &str) -> rusqlite::Result<bool> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM login WHERE user = ?1 AND password = ?2")?;
        stmt.exists(rusqlite::params![user, password])
    }

    pub fn add_credential(&self, user: &str, password: &str) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO login (user, password) VALUES (?1, ?2)",
            rusqlite::params![user, password],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn downloads(&self, root_key: &str, name: &str) -> rusqlite::Result<Option<u64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT downloads FROM entries WHERE root_key = ?1 AND name = ?2")?;
        let mut rows = stmt.query(rusqlite::params![root_key, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, i64>(0)? as u64)),
            None => Ok(None),
        }
    }
}
