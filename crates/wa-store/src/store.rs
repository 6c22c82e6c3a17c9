use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;
use crate::schema;

/// Owns the single SQLite connection backing the conversational tables
/// (agents, users, conversations, messages, processed_messages). A plain
/// `Mutex<Connection>` mirrors the teacher's memory store: SQLite itself
/// serializes writers, so the mutex only needs to keep `rusqlite::Connection`
/// (which is `!Sync`) shareable across async tasks.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        schema::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
