//! JSON request/response envelope for the versioning operations.
//!
//! Requests arrive as WebSocket text frames:
//! ```text
//! {"op": "saveVersion", "requestId": 7, "docId": "d1", "user": {"name": "Ann"}}
//! ```
//! and every request is answered with
//! ```text
//! {"requestId": 7, "errno": 0, "errmsg": "success", "data": {"version": 1}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorCode, ServiceError};
use crate::model::{Author, DocumentId, DocumentMeta};
use crate::service::VersioningService;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ApiRequest {
    #[serde(rename_all = "camelCase")]
    GetVersionList {
        #[serde(default)]
        doc_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SaveVersion {
        #[serde(default)]
        doc_id: String,
        #[serde(default)]
        user: Option<Author>,
    },
    #[serde(rename_all = "camelCase")]
    RecoveryVersion {
        #[serde(default)]
        doc_id: String,
        #[serde(default)]
        version: i64,
    },
    #[serde(rename_all = "camelCase")]
    RenameDocument {
        #[serde(default)]
        doc_id: String,
        #[serde(default)]
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    GetDocInfo {
        #[serde(default)]
        doc_id: String,
    },
}

impl ApiRequest {
    pub fn op(&self) -> &'static str {
        match self {
            ApiRequest::GetVersionList { .. } => "getVersionList",
            ApiRequest::SaveVersion { .. } => "saveVersion",
            ApiRequest::RecoveryVersion { .. } => "recoveryVersion",
            ApiRequest::RenameDocument { .. } => "renameDocument",
            ApiRequest::GetDocInfo { .. } => "getDocInfo",
        }
    }
}

/// A request plus the optional correlation id echoed in the response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiFrame {
    #[serde(default, rename = "requestId")]
    pub request_id: Option<Value>,
    #[serde(flatten)]
    pub request: ApiRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub errno: i32,
    pub errmsg: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn success(data: Value) -> Self {
        Self {
            request_id: None,
            errno: ErrorCode::Success.errno(),
            errmsg: ErrorCode::Success.message().to_string(),
            data,
        }
    }

    pub fn failure(err: &ApiError) -> Self {
        Self {
            request_id: None,
            errno: err.errno(),
            errmsg: err.to_string(),
            data: json!({}),
        }
    }

    fn with_request_id(mut self, request_id: Option<Value>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn to_json(&self) -> String {
        // A struct of strings, integers and JSON values always serializes
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid params: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ApiError {
    pub fn errno(&self) -> i32 {
        match self {
            ApiError::Malformed(_) => ErrorCode::InvalidParams.errno(),
            ApiError::Service(e) => e.errno(),
        }
    }
}

fn parse_doc_id(raw: &str) -> Result<DocumentId, ServiceError> {
    DocumentId::parse(raw).ok_or_else(|| ServiceError::invalid("docId is missing or invalid"))
}

fn doc_info(meta: &DocumentMeta) -> Value {
    json!({
        "docId": meta.doc_id,
        "title": meta.title,
        "currentVersion": meta.current_version,
    })
}

/// Run one decoded request against the service.
pub async fn handle(service: &VersioningService, request: ApiRequest) -> Result<Value, ServiceError> {
    match request {
        ApiRequest::GetVersionList { doc_id } => {
            let doc_id = parse_doc_id(&doc_id)?;
            let versions = service.list_versions(&doc_id).await?;
            Ok(json!({ "versions": versions }))
        }
        ApiRequest::SaveVersion { doc_id, user } => {
            let doc_id = parse_doc_id(&doc_id)?;
            let user = user.ok_or_else(|| ServiceError::invalid("user is required"))?;
            let record = service.save_version(&doc_id, user).await?;
            Ok(json!({ "version": record.version }))
        }
        ApiRequest::RecoveryVersion { doc_id, version } => {
            let doc_id = parse_doc_id(&doc_id)?;
            let version = u64::try_from(version)
                .map_err(|_| ServiceError::invalid("version must be positive"))?;
            service.revert_version(&doc_id, version).await?;
            Ok(json!({}))
        }
        ApiRequest::RenameDocument { doc_id, title } => {
            let doc_id = parse_doc_id(&doc_id)?;
            service.rename_document(&doc_id, &title).await?;
            Ok(json!({}))
        }
        ApiRequest::GetDocInfo { doc_id } => {
            let doc_id = parse_doc_id(&doc_id)?;
            let meta = service.get_doc_info(&doc_id).await?;
            Ok(doc_info(&meta))
        }
    }
}

/// Decode a text frame, run it and build the response envelope.
pub async fn dispatch(service: &VersioningService, text: &str) -> ApiResponse {
    let frame: ApiFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Rejected malformed API request: {e}");
            // Echo the correlation id even when the rest does not parse
            let request_id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("requestId").cloned());
            return ApiResponse::failure(&ApiError::from(e)).with_request_id(request_id);
        }
    };

    let op = frame.request.op();
    let response = match handle(service, frame.request).await {
        Ok(data) => ApiResponse::success(data),
        Err(e) => {
            log::debug!("{op} answered with errno {}: {e}", e.errno());
            ApiResponse::failure(&ApiError::from(e))
        }
    };
    response.with_request_id(frame.request_id)
}
