//! Catalog backing the `query_products` tool.

use rusqlite::{params, Row};

use wa_core::model::Product;

use crate::error::Result;
use crate::store::Store;

fn row_to_product(row: &Row) -> rusqlite::Result<Product> {
    let active: i64 = row.get("active")?;
    Ok(Product {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        price: row.get("price")?,
        sku: row.get("sku")?,
        active: active != 0,
    })
}

impl Store {
    pub fn create_product(
        &self,
        agent_id: i64,
        name: &str,
        description: &str,
        price: f64,
        sku: Option<&str>,
    ) -> Result<Product> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (agent_id, name, description, price, sku, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![agent_id, name, description, price, sku],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_product(id)
    }

    pub fn get_product(&self, id: i64) -> Result<Product> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT * FROM products WHERE id = ?1",
            params![id],
            row_to_product,
        )?)
    }

    /// Active products for `agent_id`, optionally narrowed to those whose
    /// name or description contains `query` (case-insensitive substring).
    pub fn query_products(&self, agent_id: i64, query: Option<&str>, limit: i64) -> Result<Vec<Product>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match query {
            Some(q) if !q.trim().is_empty() => {
                let pattern = format!("%{}%", q.replace('%', "").replace('_', ""));
                let mut stmt = conn.prepare(
                    "SELECT * FROM products
                     WHERE agent_id = ?1 AND active = 1
                       AND (name LIKE ?2 COLLATE NOCASE OR description LIKE ?2 COLLATE NOCASE)
                     ORDER BY name LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![agent_id, pattern, limit], row_to_product)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM products WHERE agent_id = ?1 AND active = 1 ORDER BY name LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![agent_id, limit], row_to_product)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_filters_by_name_case_insensitively() {
        let store = Store::open_in_memory().unwrap();
        store.create_product(1, "Red Shirt", "cotton", 19.99, Some("SKU1")).unwrap();
        store.create_product(1, "Blue Jeans", "denim", 39.99, Some("SKU2")).unwrap();
        let found = store.query_products(1, Some("shirt"), 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Red Shirt");
    }

    #[test]
    fn query_without_filter_returns_all_active() {
        let store = Store::open_in_memory().unwrap();
        store.create_product(1, "A", "", 1.0, None).unwrap();
        store.create_product(1, "B", "", 2.0, None).unwrap();
        assert_eq!(store.query_products(1, None, 10).unwrap().len(), 2);
    }
}
