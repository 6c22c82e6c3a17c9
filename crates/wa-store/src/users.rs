use chrono::Utc;
use rusqlite::{params, Row};

use wa_core::model::{Gender, User};

use crate::error::{Error, Result};
use crate::store::Store;

fn gender_to_str(g: Gender) -> &'static str {
    match g {
        Gender::Male => "male",
        Gender::Female => "female",
        Gender::Unknown => "unknown",
    }
}

fn gender_from_str(s: &str) -> Gender {
    match s {
        "male" => Gender::Male,
        "female" => Gender::Female,
        _ => Gender::Unknown,
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let metadata_json: String = row.get("metadata_json")?;
    let gender: String = row.get("gender")?;
    Ok(User {
        id: row.get("id")?,
        phone: row.get("phone")?,
        display_name: row.get("display_name")?,
        gender: gender_from_str(&gender),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
    })
}

impl Store {
    /// Find the user row for `phone`, creating it if this is the first time
    /// this number has been seen (I1: a phone number identifies exactly one
    /// `User` row across every agent).
    pub fn find_or_create_user_by_phone(&self, phone: &str) -> Result<User> {
        if let Some(user) = self.find_user_by_phone(phone)? {
            return Ok(user);
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT INTO users (phone, gender, created_at, updated_at)
             VALUES (?1, 'unknown', ?2, ?2)
             ON CONFLICT(phone) DO NOTHING",
            params![phone, now],
        )?;
        drop(conn);
        let _ = inserted;
        self.find_user_by_phone(phone)?
            .ok_or_else(|| Error::NotFound(format!("user {phone}")))
    }

    pub fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT * FROM users WHERE phone = ?1",
            params![phone],
            row_to_user,
        ) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("user {id}")),
                other => Error::Database(other),
            })
    }

    pub fn update_user_profile(
        &self,
        id: i64,
        display_name: Option<&str>,
        gender: Option<Gender>,
    ) -> Result<()> {
        let current = self.get_user(id)?;
        let conn = self.conn.lock().unwrap();
        let name = display_name.map(str::to_string).or(current.display_name);
        let gender = gender.unwrap_or(current.gender);
        conn.execute(
            "UPDATE users SET display_name = ?2, gender = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, name, gender_to_str(gender), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn merge_user_metadata(&self, id: i64, patch: serde_json::Value) -> Result<()> {
        let current = self.get_user(id)?;
        let mut metadata = current.metadata;
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }
        if let (Some(existing), Some(incoming)) = (metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in incoming {
                existing.insert(k.clone(), v.clone());
            }
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET metadata_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(&metadata)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_is_idempotent_per_phone() {
        let store = Store::open_in_memory().unwrap();
        let a = store.find_or_create_user_by_phone("+972500000001").unwrap();
        let b = store.find_or_create_user_by_phone("+972500000001").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn distinct_phones_get_distinct_users() {
        let store = Store::open_in_memory().unwrap();
        let a = store.find_or_create_user_by_phone("+972500000001").unwrap();
        let b = store.find_or_create_user_by_phone("+972500000002").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn profile_update_preserves_unspecified_fields() {
        let store = Store::open_in_memory().unwrap();
        let user = store.find_or_create_user_by_phone("+972500000003").unwrap();
        store
            .update_user_profile(user.id, Some("Dana"), Some(Gender::Female))
            .unwrap();
        store.update_user_profile(user.id, None, None).unwrap();
        let fetched = store.get_user(user.id).unwrap();
        assert_eq!(fetched.display_name.as_deref(), Some("Dana"));
        assert_eq!(fetched.gender, Gender::Female);
    }

    #[test]
    fn metadata_merge_is_shallow() {
        let store = Store::open_in_memory().unwrap();
        let user = store.find_or_create_user_by_phone("+972500000004").unwrap();
        store
            .merge_user_metadata(user.id, serde_json::json!({"city": "Tel Aviv"}))
            .unwrap();
        store
            .merge_user_metadata(user.id, serde_json::json!({"age": 30}))
            .unwrap();
        let fetched = store.get_user(user.id).unwrap();
        assert_eq!(fetched.metadata["city"], "Tel Aviv");
        assert_eq!(fetched.metadata["age"], 30);
    }
}
