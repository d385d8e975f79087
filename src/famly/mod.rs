//! Famly API access: the HTTP client, wire types and the paginated media
//! sources built on top of them.

pub mod error;
pub mod media;
pub mod pagination;
mod queries;
pub mod responses;

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

pub use error::ApiError;
pub use media::{MediaItem, MediaKind, MediaOrigin, Resolution};
pub use responses::ChildProfile;

use crate::credentials::Credential;
use crate::download::file::ACCESS_TOKEN_HEADER;
use crate::retry::{self, RetryAction, RetryConfig};
use responses::{
    Conversation, ConversationSummary, GraphQlResponse, ObservationsData, ObservationsPage,
    SidebarResponse, TaggedImagesBody,
};

pub const DEFAULT_API_BASE: &str = "https://app.famly.co";

const TAGGED_IMAGES_PATH: &str = "/api/v2/images/tagged";
const SIDEBAR_PATH: &str = "/api/v2/sidebar";
const GRAPHQL_PATH: &str = "/graphql";
const CONVERSATIONS_PATH: &str = "/api/v2/conversations";

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:146.0) Gecko/20100101 Firefox/146.0";

/// Thin client over the Famly endpoints. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base_url: &str, retry: RetryConfig, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::fatal(base_url, format!("invalid API base URL: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert("x-famly-platform", HeaderValue::from_static("docker"));
        if let Ok(referer) = HeaderValue::from_str(base_url.as_str()) {
            headers.insert(REFERER, referer);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::from_transport(base_url.as_str(), &e))?;

        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::fatal(path, format!("cannot build URL: {e}")))
    }

    /// One page of the tagged-images feed: records `offset..offset + limit`.
    /// Returns the images and the server's total count, when it sends one.
    pub async fn fetch_tagged_images_page(
        &self,
        credential: &Credential,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<responses::TaggedImage>, Option<u64>), ApiError> {
        let url = self.endpoint(TAGGED_IMAGES_PATH)?;
        let query = [
            ("childId", credential.child_id.clone()),
            ("from", offset.to_string()),
            ("to", (offset + limit).to_string()),
        ];
        let body: TaggedImagesBody = self
            .execute(TAGGED_IMAGES_PATH, || {
                self.client
                    .get(url.clone())
                    .header(ACCESS_TOKEN_HEADER, &credential.access_token)
                    .query(&query)
            })
            .await?;
        Ok(body.into_parts())
    }

    /// One page of the observations feed, starting after `after`.
    pub async fn fetch_observations_page(
        &self,
        credential: &Credential,
        child_ids: &[String],
        first: u32,
        after: Option<&str>,
    ) -> Result<ObservationsPage, ApiError> {
        let url = self.endpoint(GRAPHQL_PATH)?;
        let request = queries::observations_request(child_ids, first, after);
        let response: GraphQlResponse<ObservationsData> = self
            .execute(GRAPHQL_PATH, || {
                self.client
                    .post(url.clone())
                    .header(ACCESS_TOKEN_HEADER, &credential.access_token)
                    .json(&request)
            })
            .await?;

        if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ApiError::fatal(
                GRAPHQL_PATH,
                format!("GraphQL errors: {}", messages.join("; ")),
            ));
        }
        response
            .data
            .map(|d| d.child_development.observations)
            .ok_or_else(|| ApiError::fatal(GRAPHQL_PATH, "response has neither data nor errors"))
    }

    /// Every conversation the token's guardian takes part in.
    pub async fn fetch_conversations(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = self.endpoint(CONVERSATIONS_PATH)?;
        self.execute(CONVERSATIONS_PATH, || {
            self.client
                .get(url.clone())
                .header(ACCESS_TOKEN_HEADER, &credential.access_token)
        })
        .await
    }

    /// One conversation with its messages.
    pub async fn fetch_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> Result<Conversation, ApiError> {
        let mut url = self.endpoint(CONVERSATIONS_PATH)?;
        url.path_segments_mut()
            .map_err(|()| ApiError::fatal(CONVERSATIONS_PATH, "API base cannot carry a path"))?
            .push(conversation_id);
        self.execute(CONVERSATIONS_PATH, || {
            self.client
                .get(url.clone())
                .header(ACCESS_TOKEN_HEADER, &credential.access_token)
        })
        .await
    }

    /// Children visible to an access token, from the sidebar.
    pub async fn fetch_children(&self, access_token: &str) -> Result<Vec<ChildProfile>, ApiError> {
        let url = self.endpoint(SIDEBAR_PATH)?;
        let sidebar: SidebarResponse = self
            .execute(SIDEBAR_PATH, || {
                self.client
                    .get(url.clone())
                    .header(ACCESS_TOKEN_HEADER, access_token)
            })
            .await?;
        Ok(sidebar.into_children())
    }

    /// Send a request built by `build`, retrying transient failures. The
    /// builder runs once per attempt since a `RequestBuilder` is single-use.
    async fn execute<T, B>(&self, endpoint: &str, build: B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        retry::retry_with_backoff(
            &self.retry,
            endpoint,
            |e: &ApiError| {
                if e.is_transient() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            |_| {
                let request = build();
                async move { send_json(endpoint, request).await }
            },
        )
        .await
    }
}

async fn send_json<T: DeserializeOwned>(
    endpoint: &str,
    request: RequestBuilder,
) -> Result<T, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|e| ApiError::from_transport(endpoint, &e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::from_transport(endpoint, &e))?;
    if !status.is_success() {
        return Err(ApiError::from_status(endpoint, status.as_u16(), &body));
    }
    tracing::debug!(endpoint, bytes = body.len(), "API response");
    serde_json::from_str(&body)
        .map_err(|e| ApiError::fatal(endpoint, format!("cannot decode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.uri(), RetryConfig::immediate(2), Duration::from_secs(5)).unwrap()
    }

    fn credential() -> Credential {
        Credential::new("child-1", "tok-abc")
    }

    #[tokio::test]
    async fn test_tagged_images_page_sends_window_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .and(query_param("childId", "child-1"))
            .and(query_param("from", "100"))
            .and(query_param("to", "200"))
            .and(header(ACCESS_TOKEN_HEADER, "tok-abc"))
            .and(header("x-famly-platform", "docker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [
                    {"imageId": "a", "url": "https://cdn/a", "createdAt": "2024-01-01T00:00:00Z"}
                ],
                "totalAmount": 101
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (images, total) = client(&server)
            .fetch_tagged_images_page(&credential(), 100, 100)
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(total, Some(101));
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_tagged_images_page(&credential(), 0, 100)
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"images": [], "totalAmount": 0})),
            )
            .mount(&server)
            .await;

        let (images, total) = client(&server)
            .fetch_tagged_images_page(&credential(), 0, 100)
            .await
            .unwrap();
        assert!(images.is_empty());
        assert_eq!(total, Some(0));
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_tagged_images_page(&credential(), 0, 100)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_tagged_images_page(&credential(), 0, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_observations_page_decodes_results_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GRAPHQL_PATH))
            .and(body_partial_json(json!({
                "operationName": "GetObservations",
                "variables": {"childIds": ["child-1"], "first": 50, "after": "cur-1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"childDevelopment": {"observations": {
                    "results": [{"id": "obs-1", "remark": {"date": "2024-06-10"}, "images": []}],
                    "next": "cur-2"
                }}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_observations_page(&credential(), &["child-1".to_string()], 50, Some("cur-1"))
            .await
            .unwrap();
        assert_eq!(page.results.unwrap().len(), 1);
        assert_eq!(page.next.as_deref(), Some("cur-2"));
    }

    #[tokio::test]
    async fn test_graphql_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GRAPHQL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "Field 'x' not found"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_observations_page(&credential(), &[], 50, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Field 'x' not found"));
    }

    #[tokio::test]
    async fn test_graphql_errors_without_data_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GRAPHQL_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"errors": [{"message": "not authorised"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_observations_page(&credential(), &[], 50, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Fatal { .. }));
        assert!(err.to_string().contains("not authorised"));
    }

    #[tokio::test]
    async fn test_tagged_page_without_total_amount() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TAGGED_IMAGES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [{"imageId": "a"}, {"imageId": "b"}]
            })))
            .mount(&server)
            .await;

        let (images, total) = client(&server)
            .fetch_tagged_images_page(&credential(), 0, 2)
            .await
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(total, None);
    }

    #[tokio::test]
    async fn test_fetch_conversation_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONVERSATIONS_PATH))
            .and(header(ACCESS_TOKEN_HEADER, "tok-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"conversationId": "conv-1", "title": "Bees"},
                {"conversationId": "conv-2"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/conversations/conv-2"))
            .and(header(ACCESS_TOKEN_HEADER, "tok-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{
                    "messageId": "m1",
                    "createdAt": "2024-04-02T09:30:00Z",
                    "images": [{"imageId": "i1", "prefix": "https://img", "key": "k.jpg"}]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        let summaries = api.fetch_conversations(&credential()).await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|c| c.conversation_id.as_str()).collect();
        assert_eq!(ids, ["conv-1", "conv-2"]);

        let conversation = api.fetch_conversation(&credential(), "conv-2").await.unwrap();
        assert_eq!(conversation.messages.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_children_from_sidebar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SIDEBAR_PATH))
            .and(header(ACCESS_TOKEN_HEADER, "tok-xyz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "c1", "type": "Famly.Daycare:Child", "title": "Ada"}]
            })))
            .mount(&server)
            .await;

        let children = client(&server).fetch_children("tok-xyz").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let err = ApiClient::new("not a url", RetryConfig::default(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ApiError::Fatal { .. }));
    }
}
