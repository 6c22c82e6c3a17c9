//! `update_user_info` — the only tool that writes to the `User` row itself
//! (name/gender/free-form metadata); everything else the model remembers
//! about a customer lives in `users.metadata_json` (§4.5).

use std::sync::Arc;

use async_trait::async_trait;

use wa_core::model::Gender;
use wa_store::Store;

use super::{Tool, ToolResult};

pub struct UpdateUserInfoTool {
    store: Arc<Store>,
    user_id: i64,
}

impl UpdateUserInfoTool {
    pub fn new(store: Arc<Store>, user_id: i64) -> Self {
        Self { store, user_id }
    }
}

fn parse_gender(raw: &str) -> Option<Gender> {
    match raw.to_ascii_lowercase().as_str() {
        "male" => Some(Gender::Male),
        "female" => Some(Gender::Female),
        _ => None,
    }
}

#[async_trait]
impl Tool for UpdateUserInfoTool {
    fn name(&self) -> &str {
        "update_user_info"
    }

    fn description(&self) -> &str {
        "Record or update what is known about the current customer: their display name, \
         gender, and any other free-form detail worth remembering (e.g. preferred language, \
         delivery address). Metadata fields are merged into what's already stored — omitted \
         fields are left untouched."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "display_name": {"type": "string", "description": "Customer's name, if learned."},
                "gender": {"type": "string", "enum": ["male", "female"], "description": "Customer's gender, if learned."},
                "metadata": {
                    "type": "object",
                    "description": "Any other free-form facts to remember, merged shallowly into existing metadata."
                }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let display_name = input.get("display_name").and_then(|v| v.as_str());
        let gender = input
            .get("gender")
            .and_then(|v| v.as_str())
            .and_then(parse_gender);

        if display_name.is_some() || gender.is_some() {
            if let Err(e) = self.store.update_user_profile(self.user_id, display_name, gender) {
                return ToolResult::error(format!("update_user_info failed: {e}"));
            }
        }

        if let Some(metadata) = input.get("metadata").filter(|v| v.is_object()) {
            if let Err(e) = self.store.merge_user_metadata(self.user_id, metadata.clone()) {
                return ToolResult::error(format!("update_user_info failed: {e}"));
            }
        }

        ToolResult::success("customer info updated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_core::model::WhatsAppProvider;

    fn seed_user(store: &Store) -> i64 {
        let _agent = store.create_agent("Bot", WhatsAppProvider::Meta, "claude-3-5-sonnet").unwrap();
        store.find_or_create_user_by_phone("+972500000020").unwrap().id
    }

    #[tokio::test]
    async fn updates_profile_and_merges_metadata() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let user_id = seed_user(&store);
        let tool = UpdateUserInfoTool::new(Arc::clone(&store), user_id);
        let result = tool
            .execute(serde_json::json!({
                "display_name": "Noa",
                "gender": "female",
                "metadata": {"city": "Haifa"}
            }))
            .await;
        assert!(!result.is_error);
        let fetched = store.get_user(user_id).unwrap();
        assert_eq!(fetched.display_name.as_deref(), Some("Noa"));
        assert_eq!(fetched.gender, Gender::Female);
        assert_eq!(fetched.metadata["city"], "Haifa");
    }
}
