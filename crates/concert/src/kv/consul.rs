//! Consul HTTP API backend.
//!
//! Implements [`KeyValueStore`] over `/v1/kv` and `/v1/txn`, and
//! [`ServiceCatalog`] over `/v1/catalog/services` using blocking queries.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use super::{CatalogUpdate, KeyValueStore, KvError, KvPair, ServiceCatalog, ServiceMap};

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Header carrying the blocking query index
const INDEX_HEADER: &str = "X-Consul-Index";

/// Default maximum duration of a blocking query
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Slack added on top of the server-side wait before the client gives up
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// Client for a Consul agent
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    wait: Duration,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl KvEntry {
    fn decode(self) -> Result<KvPair, KvError> {
        let value = match self.value {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| KvError::Decode(format!("value of {}: {}", self.key, e)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
        })
    }
}

#[derive(Debug, Serialize)]
struct TxnOp<'a> {
    #[serde(rename = "KV")]
    kv: TxnKv<'a>,
}

#[derive(Debug, Serialize)]
struct TxnKv<'a> {
    #[serde(rename = "Verb")]
    verb: &'static str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Value")]
    value: String,
}

impl ConsulClient {
    /// Create a client for the agent at `address`
    ///
    /// Addresses without a scheme (`127.0.0.1:8500`) are treated as plain
    /// HTTP.
    pub fn new(address: &str, token: Option<String>) -> Result<Self, KvError> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let url = Url::parse(&raw).map_err(|e| KvError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(KvError::InvalidAddress {
                address: address.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        debug!(address = %url, has_token = token.is_some(), "Created Consul client");

        if url.cannot_be_a_base() {
            return Err(KvError::InvalidAddress {
                address: address.to_string(),
                reason: "address cannot carry a path".to_string(),
            });
        }

        Ok(Self {
            http,
            base: url,
            token,
            wait: DEFAULT_WAIT,
        })
    }

    /// Set the maximum duration of blocking catalog queries
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Base URL of the agent
    pub fn address(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// API URL under `/v1`, each segment percent-encoded
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, KvError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| KvError::InvalidAddress {
                address: self.base.to_string(),
                reason: "address cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    /// URL of a KV key; a trailing `/` is kept for prefix listings
    fn kv_endpoint(&self, key: &str) -> Result<Url, KvError> {
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        self.endpoint(std::iter::once("kv").chain(key.split('/')))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn ensure_success(response: Response, path: &str) -> Result<Response, KvError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KvError::Status {
            status: status.as_u16(),
            path: path.to_string(),
            body,
        })
    }
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("base", &self.address())
            .field("has_token", &self.token.is_some())
            .field("wait", &self.wait)
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for ConsulClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let url = self.kv_endpoint(key)?;
        let path = url.path().to_string();
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            trace!(key = %key, "Key not found");
            return Ok(None);
        }

        let response = Self::ensure_success(response, &path).await?;
        let entries: Vec<KvEntry> = response.json().await?;
        match entries.into_iter().next() {
            Some(entry) => Ok(Some(entry.decode()?.value)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let url = self.kv_endpoint(key)?;
        let path = url.path().to_string();
        let response = self
            .request(Method::PUT, url)
            .body(value.to_vec())
            .send()
            .await?;

        let response = Self::ensure_success(response, &path).await?;
        let applied: bool = response.json().await?;
        if !applied {
            return Err(KvError::Rejected(key.to_string()));
        }

        trace!(key = %key, bytes = value.len(), "Stored key");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        let url = self.kv_endpoint(prefix)?;
        let path = url.path().to_string();
        let response = self
            .request(Method::GET, url)
            .query(&[("recurse", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let response = Self::ensure_success(response, &path).await?;
        let entries: Vec<KvEntry> = response.json().await?;
        entries.into_iter().map(KvEntry::decode).collect()
    }

    async fn put_many(&self, entries: &[(&str, &[u8])]) -> Result<(), KvError> {
        let ops: Vec<TxnOp<'_>> = entries
            .iter()
            .map(|&(key, value)| TxnOp {
                kv: TxnKv {
                    verb: "set",
                    key,
                    value: BASE64.encode(value),
                },
            })
            .collect();

        let url = self.endpoint(["txn"])?;
        let response = self.request(Method::PUT, url).json(&ops).send().await?;
        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(KvError::Transaction(body));
        }
        Self::ensure_success(response, "/v1/txn").await?;

        trace!(entries = entries.len(), "Applied KV transaction");
        Ok(())
    }
}

#[async_trait]
impl ServiceCatalog for ConsulClient {
    async fn list_services(&self) -> Result<ServiceMap, KvError> {
        let url = self.endpoint(["catalog", "services"])?;
        let response = self.request(Method::GET, url).send().await?;
        let response = Self::ensure_success(response, "/v1/catalog/services").await?;
        decode_services(response).await
    }

    async fn watch_services(&self, last_index: u64) -> Result<CatalogUpdate, KvError> {
        let url = self.endpoint(["catalog", "services"])?;
        let wait = format!("{}s", self.wait.as_secs().max(1));
        let response = self
            .request(Method::GET, url)
            .query(&[("index", last_index.to_string()), ("wait", wait)])
            // Consul adds up to wait/16 of jitter to blocking queries
            .timeout(self.wait + self.wait / 16 + WAIT_SLACK)
            .send()
            .await?;
        let response = Self::ensure_success(response, "/v1/catalog/services").await?;

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| KvError::Decode(format!("missing or invalid {INDEX_HEADER} header")))?;

        let services = decode_services(response).await?;
        trace!(index, last_index, services = services.len(), "Catalog query returned");
        Ok(CatalogUpdate { index, services })
    }
}

async fn decode_services(response: Response) -> Result<ServiceMap, KvError> {
    let raw: std::collections::BTreeMap<String, Option<Vec<String>>> = response.json().await?;
    Ok(raw
        .into_iter()
        .map(|(name, tags)| (name, tags.unwrap_or_default()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_bytes, body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> ConsulClient {
        ConsulClient::new(&server.uri(), Some("acl-token".to_string())).unwrap()
    }

    #[test]
    fn test_address_without_scheme_defaults_to_http() {
        let client = ConsulClient::new("127.0.0.1:8500", None).unwrap();
        assert_eq!(client.address(), "http://127.0.0.1:8500");
    }

    #[test]
    fn test_address_with_path_prefix() {
        let client = ConsulClient::new("https://consul.internal/proxy/", None).unwrap();
        assert_eq!(client.address(), "https://consul.internal/proxy");
        assert_eq!(
            client.kv_endpoint("concert/account").unwrap().as_str(),
            "https://consul.internal/proxy/v1/kv/concert/account"
        );
    }

    #[test]
    fn test_kv_endpoint_encodes_segments() {
        let client = ConsulClient::new("127.0.0.1:8500", None).unwrap();
        assert_eq!(
            client.kv_endpoint("concert/certs/a b#c?d%e").unwrap().path(),
            "/v1/kv/concert/certs/a%20b%23c%3Fd%25e"
        );
        assert_eq!(
            client.kv_endpoint("concert/certs/").unwrap().path(),
            "/v1/kv/concert/certs/"
        );
        assert_eq!(
            client.kv_endpoint("concert/certs/*.example.com-cert.pem").unwrap().path(),
            "/v1/kv/concert/certs/*.example.com-cert.pem"
        );
    }

    #[test]
    fn test_kv_endpoint_rejects_dot_segments() {
        let client = ConsulClient::new("127.0.0.1:8500", None).unwrap();
        for key in ["concert/../secrets", "./concert", "concert/certs/.."] {
            assert!(
                matches!(client.kv_endpoint(key), Err(KvError::InvalidKey(k)) if k == key),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn test_get_escapes_reserved_characters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/concert/certs/a%3Fb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "concert/certs/a?b", "Value": BASE64.encode(b"v")}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let value = client(&server).await.get("concert/certs/a?b").await.unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_put_rejects_dot_segment_key() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(0)
            .mount(&server)
            .await;

        let result = client(&server).await.put("concert/../acl", b"v").await;
        assert!(matches!(result, Err(KvError::InvalidKey(_))));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let result = ConsulClient::new("ftp://consul:8500", None);
        assert!(matches!(result, Err(KvError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_get_decodes_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/concert/account"))
            .and(header(TOKEN_HEADER, "acl-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "concert/account", "Value": BASE64.encode(b"{\"Email\":\"a\"}"), "Flags": 0}
            ])))
            .mount(&server)
            .await;

        let value = client(&server).await.get("concert/account").await.unwrap();
        assert_eq!(value, Some(b"{\"Email\":\"a\"}".to_vec()));
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/concert/account"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let value = client(&server).await.get("concert/account").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_get_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
            .mount(&server)
            .await;

        let result = client(&server).await.get("concert/account").await;
        match result {
            Err(KvError::Status { status, body, .. }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "No cluster leader");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_sends_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/concert/certs/a.example.com-key.pem"))
            .and(body_bytes(b"key-bytes".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .put("concert/certs/a.example.com-key.pem", b"key-bytes")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(false)))
            .mount(&server)
            .await;

        let result = client(&server).await.put("k", b"v").await;
        assert!(matches!(result, Err(KvError::Rejected(key)) if key == "k"));
    }

    #[tokio::test]
    async fn test_list_recurses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/concert/certs/"))
            .and(query_param("recurse", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Key": "concert/certs/a.example.com-cert.pem", "Value": BASE64.encode(b"cert")},
                {"Key": "concert/certs/a.example.com-key.pem", "Value": BASE64.encode(b"key")},
                {"Key": "concert/certs/", "Value": null}
            ])))
            .mount(&server)
            .await;

        let pairs = client(&server).await.list("concert/certs/").await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].value, b"cert".to_vec());
        assert_eq!(pairs[1].key, "concert/certs/a.example.com-key.pem");
        assert!(pairs[2].value.is_empty());
    }

    #[tokio::test]
    async fn test_list_empty_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let pairs = client(&server).await.list("concert/certs/").await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_put_many_uses_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/txn"))
            .and(body_json(json!([
                {"KV": {"Verb": "set", "Key": "p/a-key.pem", "Value": BASE64.encode(b"k")}},
                {"KV": {"Verb": "set", "Key": "p/a-cert.pem", "Value": BASE64.encode(b"c")}}
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Results": [], "Errors": null})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .put_many(&[("p/a-key.pem", b"k".as_slice()), ("p/a-cert.pem", b"c".as_slice())])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_many_rollback() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/txn"))
            .respond_with(ResponseTemplate::new(409).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let result = client(&server)
            .await
            .put_many(&[("p/a-key.pem", b"k".as_slice())])
            .await;
        assert!(matches!(result, Err(KvError::Transaction(_))));
    }

    #[tokio::test]
    async fn test_list_services() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/catalog/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "consul": [],
                "web": ["concert-api.example.com", "http"],
                "legacy": null
            })))
            .mount(&server)
            .await;

        let services = client(&server).await.list_services().await.unwrap();
        assert_eq!(services.len(), 3);
        assert_eq!(services["web"], vec!["concert-api.example.com", "http"]);
        assert!(services["legacy"].is_empty());
    }

    #[tokio::test]
    async fn test_watch_services_blocking_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/catalog/services"))
            .and(query_param("index", "41"))
            .and(query_param("wait", "2s"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INDEX_HEADER, "42")
                    .set_body_json(json!({"web": ["concert-a.example.com"]})),
            )
            .mount(&server)
            .await;

        let client = client(&server).await.with_wait(Duration::from_secs(2));
        let update = client.watch_services(41).await.unwrap();
        assert_eq!(update.index, 42);
        assert_eq!(update.services["web"], vec!["concert-a.example.com"]);
    }

    #[tokio::test]
    async fn test_watch_services_requires_index_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/catalog/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let result = client(&server).await.watch_services(0).await;
        assert!(matches!(result, Err(KvError::Decode(_))));
    }
}
