//! Client for the content-management backend's material pre-submit call.
//!
//! `POST {base}/api/material/pre-submit` answers with an envelope
//! `{"code": 0, "msg": "...", "data": {"materialId": "..."}}`. A non-zero
//! code on a 2xx response is a service-side rejection.

use async_trait::async_trait;
use clipflow_core::{DownstreamClient, FileType, PreSubmitRequest, TagEncoding};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{HttpConfig, ensure_success};
use crate::error::HttpError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreSubmitBody<'a> {
    product_id: &'a str,
    file_type: FileType,
    file_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag_ids: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag_names: Option<&'a str>,
}

impl<'a> From<&'a PreSubmitRequest> for PreSubmitBody<'a> {
    fn from(request: &'a PreSubmitRequest) -> Self {
        let (tag_ids, tag_names) = match request.tag_encoding {
            TagEncoding::Ids => (Some(request.tags.as_str()), None),
            TagEncoding::Names => (None, Some(request.tags.as_str())),
        };
        Self {
            product_id: &request.product_id,
            file_type: request.file_type,
            file_path: &request.file_path,
            tag_ids,
            tag_names,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default, alias = "message")]
    msg: String,
    #[serde(default)]
    data: Option<MaterialData>,
}

#[derive(Debug, Deserialize)]
struct MaterialData {
    #[serde(alias = "id", alias = "material_id")]
    #[serde(rename = "materialId")]
    material_id: serde_json::Value,
}

pub struct HttpDownstreamClient {
    config: HttpConfig,
    client: Client,
}

impl HttpDownstreamClient {
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        let client = config.build_client()?;
        Ok(Self { config, client })
    }

    async fn send(&self, request: &PreSubmitRequest) -> Result<String, HttpError> {
        let body = PreSubmitBody::from(request);
        let response = self
            .client
            .post(self.config.url("api/material/pre-submit"))
            .json(&body)
            .send()
            .await?;
        let envelope: Envelope = ensure_success(response).await?.json().await?;
        if envelope.code != 0 && envelope.code != 200 {
            return Err(HttpError::Service {
                code: envelope.code,
                message: envelope.msg,
            });
        }
        // Ids come back as numbers or strings depending on the deployment.
        let material_id = match envelope.data.map(|d| d.material_id) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(HttpError::invalid("pre-submit response carries no material id")),
        };
        debug!(
            product_id = %request.product_id,
            encoding = %request.tag_encoding,
            material_id = %material_id,
            "material pre-submitted"
        );
        Ok(material_id)
    }
}

#[async_trait]
impl DownstreamClient for HttpDownstreamClient {
    async fn pre_submit(&self, request: &PreSubmitRequest) -> clipflow_core::Result<String> {
        match self.send(request).await {
            Ok(id) => Ok(id),
            Err(e) => {
                info!(file = %request.file_path, encoding = %request.tag_encoding, error = %e, "pre-submit rejected");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipflow_core::{ErrorKind, RetryPolicy};
    use mockito::Matcher;
    use serde_json::json;

    fn request(encoding: TagEncoding, tags: &str) -> PreSubmitRequest {
        PreSubmitRequest {
            product_id: "p-1".into(),
            file_type: FileType::Video,
            file_path: "s1/a-job.mp4".into(),
            tags: tags.into(),
            tag_encoding: encoding,
        }
    }

    #[tokio::test]
    async fn id_encoding_goes_in_tag_ids() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/material/pre-submit")
            .match_header("authorization", "Bearer t0ken")
            .match_body(Matcher::Json(json!({
                "productId": "p-1",
                "fileType": "video",
                "filePath": "s1/a-job.mp4",
                "tagIds": "12,40"
            })))
            .with_body(r#"{"code":0,"msg":"ok","data":{"materialId":98765}}"#)
            .create_async()
            .await;

        let client =
            HttpDownstreamClient::new(HttpConfig::new(server.url()).with_token("t0ken")).unwrap();
        let id = client
            .pre_submit(&request(TagEncoding::Ids, "12,40"))
            .await
            .unwrap();
        assert_eq!(id, "98765");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn name_encoding_goes_in_tag_names() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/material/pre-submit")
            .match_body(Matcher::PartialJson(json!({ "tagNames": "海,Portrait" })))
            .with_body(r#"{"code":0,"data":{"materialId":"m-1"}}"#)
            .create_async()
            .await;

        let client = HttpDownstreamClient::new(HttpConfig::new(server.url())).unwrap();
        let id = client
            .pre_submit(&request(TagEncoding::Names, "海,Portrait"))
            .await
            .unwrap();
        assert_eq!(id, "m-1");
    }

    #[tokio::test]
    async fn envelope_failure_feeds_the_retry_policy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/material/pre-submit")
            .with_body(r#"{"code":5001,"msg":"tagIds parse error"}"#)
            .create_async()
            .await;

        let client = HttpDownstreamClient::new(HttpConfig::new(server.url())).unwrap();
        let err = client
            .pre_submit(&request(TagEncoding::Ids, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert!(RetryPolicy::default().is_parsing_failure(&err));
    }

    #[tokio::test]
    async fn bad_request_is_retryable_but_auth_is_not() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/material/pre-submit")
            .match_body(Matcher::PartialJson(json!({ "tagIds": "1" })))
            .with_status(400)
            .with_body("Bad Request")
            .create_async()
            .await;
        server
            .mock("POST", "/api/material/pre-submit")
            .match_body(Matcher::PartialJson(json!({ "tagIds": "2" })))
            .with_status(401)
            .create_async()
            .await;

        let client = HttpDownstreamClient::new(HttpConfig::new(server.url())).unwrap();
        let policy = RetryPolicy::default();

        let bad = client
            .pre_submit(&request(TagEncoding::Ids, "1"))
            .await
            .unwrap_err();
        assert!(policy.is_parsing_failure(&bad));

        let auth = client
            .pre_submit(&request(TagEncoding::Ids, "2"))
            .await
            .unwrap_err();
        assert_eq!(auth.kind(), ErrorKind::Auth);
        assert!(!policy.is_parsing_failure(&auth));
    }

    #[tokio::test]
    async fn missing_material_id_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/material/pre-submit")
            .with_body(r#"{"code":0,"data":{"materialId":""}}"#)
            .create_async()
            .await;

        let client = HttpDownstreamClient::new(HttpConfig::new(server.url())).unwrap();
        let err = client
            .pre_submit(&request(TagEncoding::Ids, "1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
