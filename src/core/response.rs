use axum::{http::StatusCode, Json};
use serde::Serialize;

use super::pagination::Page;

#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListMeta {
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub data: Vec<T>,
    pub meta: ListMeta,
}

pub fn ok<T: Serialize>(request_id: impl Into<String>, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        data,
        meta: Meta {
            request_id: request_id.into(),
        },
    })
}

pub fn created<T: Serialize>(
    request_id: impl Into<String>,
    data: T,
) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, ok(request_id, data))
}

pub fn list<T: Serialize>(request_id: impl Into<String>, page: Page<T>) -> Json<ListResponse<T>> {
    Json(ListResponse {
        meta: ListMeta {
            total: page.total,
            page: page.page,
            per_page: page.per_page,
            request_id: request_id.into(),
        },
        data: page.items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_shape() {
        let Json(body) = ok("req-1", json!({"id": 7}));
        let value = serde_json::to_value(body).expect("serialize");
        assert_eq!(value, json!({"data": {"id": 7}, "meta": {"request_id": "req-1"}}));
    }

    #[test]
    fn test_list_envelope_shape() {
        let page = Page {
            items: vec![1, 2],
            total: 12,
            page: 2,
            per_page: 2,
        };
        let Json(body) = list("req-2", page);
        let value = serde_json::to_value(body).expect("serialize");
        assert_eq!(
            value,
            json!({
                "data": [1, 2],
                "meta": {"total": 12, "page": 2, "per_page": 2, "request_id": "req-2"}
            })
        );
    }
}
