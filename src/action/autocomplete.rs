//! Autocomplete for interactive field population.
//!
//! Not part of event delivery: a UI asks an action for suggestions for one
//! of its fields and pages through them with an opaque cursor.

use super::{ExecuteInput, RequestClient, StepError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutocompleteItem {
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(rename = "nextPage", skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutocompleteResponse {
    pub data: Vec<AutocompleteItem>,
    pub pagination: Pagination,
}

impl AutocompleteResponse {
    pub fn new(data: Vec<AutocompleteItem>) -> Self {
        Self {
            data,
            pagination: Pagination::default(),
        }
    }

    pub fn with_next_page(mut self, next_page: Option<String>) -> Self {
        self.pagination.next_page = next_page;
        self
    }
}

/// Produces one page of suggestions. `input.page` carries the cursor.
#[async_trait]
pub trait Autocomplete: Send + Sync {
    async fn complete(
        &self,
        client: RequestClient,
        input: ExecuteInput,
    ) -> Result<AutocompleteResponse, StepError>;
}

#[async_trait]
impl<F, Fut> Autocomplete for F
where
    F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AutocompleteResponse, StepError>> + Send + 'static,
{
    async fn complete(
        &self,
        client: RequestClient,
        input: ExecuteInput,
    ) -> Result<AutocompleteResponse, StepError> {
        (self)(client, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        let response = AutocompleteResponse::new(vec![AutocompleteItem {
            label: "Acme".into(),
            value: json!(1),
        }])
        .with_next_page(Some("100".into()));

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"data": [{"label": "Acme", "value": 1}], "pagination": {"nextPage": "100"}})
        );
        assert_eq!(
            serde_json::to_value(AutocompleteResponse::default()).unwrap(),
            json!({"data": [], "pagination": {}})
        );
    }
}
