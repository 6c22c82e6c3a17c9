use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;
use crate::schema;

pub struct SchedulerStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SchedulerStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        schema::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
