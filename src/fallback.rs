use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::retry::{rate_limit_error, RetryPolicy};
use crate::users::{CoordinateResult, UserRecord};

const SERVICE: &str = "openai";
const SYSTEM_PROMPT: &str = "Estimate an approximate latitude and longitude for each user from their \
location text. Respond with JSON shaped as {\"results\": [{\"id\": \"user_id\", \"lat\": number, \
\"long\": number, \"confidence\": number}]} where confidence is between 0 and 100. Leave out any \
location that is a joke, a placeholder or otherwise not a real place instead of guessing.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationQuery {
    pub id: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocatedUser {
    pub id: String,
    pub lat: f64,
    pub long: f64,
    pub confidence: f64,
}

#[async_trait]
pub trait BatchLocator: Send + Sync {
    /// Coordinates for any subset of `queries`; omitted ids are unknown.
    async fn locate(&self, queries: &[LocationQuery]) -> AppResult<Vec<LocatedUser>>;
}

/// Second resolver tier: one batched language-model request per chunk.
#[derive(Clone)]
pub struct FallbackResolver {
    locator: Arc<dyn BatchLocator>,
    retry: RetryPolicy,
}

impl FallbackResolver {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.require_openai_key()?;
        let client = ChatCompletionsLocator::new(
            &config.openai_base_url,
            &config.openai_model,
            api_key,
            config.http_timeout(),
        )?;
        Ok(Self::with_locator(
            Arc::new(client),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn with_locator(locator: Arc<dyn BatchLocator>, retry: RetryPolicy) -> Self {
        Self { locator, retry }
    }

    /// Resolves what it can and keys the answers by user id.
    ///
    /// A failed call yields an empty map so every member of the batch falls
    /// through to unresolved; only an exhausted rate-limit budget is an error.
    pub async fn resolve(
        &self,
        users: &[UserRecord],
    ) -> AppResult<HashMap<String, CoordinateResult>> {
        let queries: Vec<LocationQuery> = users
            .iter()
            .filter(|user| !user.location().trim().is_empty())
            .map(|user| LocationQuery {
                id: user.id.clone(),
                location: user.location().to_string(),
            })
            .collect();
        if queries.is_empty() {
            return Ok(HashMap::new());
        }

        let requested: HashSet<&str> = queries.iter().map(|q| q.id.as_str()).collect();
        let queries = &queries;
        let outcome = self
            .retry
            .run(SERVICE, move || async move { self.locator.locate(queries).await })
            .await;

        let located = match outcome {
            Ok(located) => located,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(?err, batch = queries.len(), "fallback geocoding failed");
                return Ok(HashMap::new());
            }
        };

        let mut results = HashMap::with_capacity(located.len());
        for entry in located {
            if !requested.contains(entry.id.as_str()) {
                debug!(id = %entry.id, "ignoring fallback result for unrequested id");
                continue;
            }
            results.entry(entry.id).or_insert(CoordinateResult {
                lat: entry.lat,
                long: entry.long,
                confidence: entry.confidence,
            });
        }
        info!(
            requested = queries.len(),
            resolved = results.len(),
            "fallback batch complete"
        );
        Ok(results)
    }
}

/// OpenAI-compatible `chat/completions` client in JSON-object mode.
pub struct ChatCompletionsLocator {
    http: Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl ChatCompletionsLocator {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> AppResult<Self> {
        if model.trim().is_empty() {
            return Err(AppError::Config("OPENAI_MODEL must not be empty".into()));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl BatchLocator for ChatCompletionsLocator {
    async fn locate(&self, queries: &[LocationQuery]) -> AppResult<Vec<LocatedUser>> {
        #[derive(Serialize)]
        struct RequestBody<'a> {
            model: &'a str,
            response_format: ResponseFormat,
            messages: Vec<Message>,
        }

        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }

        #[derive(Serialize)]
        struct Message {
            role: &'static str,
            content: String,
        }

        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }

        #[derive(Deserialize)]
        struct ChoiceMessage {
            #[serde(default)]
            content: Option<String>,
        }

        let body = RequestBody {
            model: &self.model,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user",
                    content: serde_json::to_string(queries)?,
                },
            ],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        if let Some(err) = rate_limit_error(SERVICE, &response) {
            return Err(err);
        }

        let parsed: Response = response.error_for_status()?.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_else(|| "{}".to_string());
        parse_results(&content)
    }
}

/// Parses `{"results": [...]}`, dropping individual entries that do not fit.
pub fn parse_results(content: &str) -> AppResult<Vec<LocatedUser>> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        results: Vec<serde_json::Value>,
    }

    let payload: Payload = serde_json::from_str(content)
        .map_err(|err| AppError::Parse(format!("fallback response is not valid JSON: {err}")))?;
    Ok(payload
        .results
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<LocatedUser>(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(?err, "skipping malformed fallback entry");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use parking_lot::Mutex;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;

    use super::*;

    struct ScriptedLocator {
        response: Mutex<Option<AppResult<Vec<LocatedUser>>>>,
        requests: Mutex<Vec<Vec<LocationQuery>>>,
    }

    impl ScriptedLocator {
        fn new(response: AppResult<Vec<LocatedUser>>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BatchLocator for ScriptedLocator {
        async fn locate(&self, queries: &[LocationQuery]) -> AppResult<Vec<LocatedUser>> {
            self.requests.lock().push(queries.to_vec());
            self.response.lock().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn user(id: &str, location: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            name: None,
            real_name: None,
            location_field: Some(location.into()),
            school_field: None,
            phone: None,
            locale: None,
        }
    }

    fn located(id: &str, confidence: f64) -> LocatedUser {
        LocatedUser {
            id: id.into(),
            lat: 10.0,
            long: 20.0,
            confidence,
        }
    }

    fn resolver(locator: Arc<ScriptedLocator>) -> FallbackResolver {
        FallbackResolver::with_locator(
            locator,
            RetryPolicy::with_rng(2, Duration::ZERO, StdRng::seed_from_u64(9)),
        )
    }

    #[tokio::test]
    async fn sends_one_request_and_keys_results_by_id() {
        let locator = ScriptedLocator::new(Ok(vec![
            located("U1", 150.0),
            located("U1", 10.0),
            located("U9", 80.0),
        ]));
        let results = resolver(locator.clone())
            .resolve(&[user("U1", "the big apple"), user("U2", "cat kingdom"), user("U3", " ")])
            .await
            .unwrap();

        let requests = locator.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            vec![
                LocationQuery {
                    id: "U1".into(),
                    location: "the big apple".into()
                },
                LocationQuery {
                    id: "U2".into(),
                    location: "cat kingdom".into()
                },
            ]
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results["U1"].confidence, 150.0);
    }

    #[tokio::test]
    async fn failures_yield_no_results() {
        let locator = ScriptedLocator::new(Err(AppError::Parse("boom".into())));
        let results = resolver(locator).resolve(&[user("U1", "Paris")]).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn skips_call_when_nothing_to_ask() {
        let locator = ScriptedLocator::new(Ok(vec![]));
        let results = resolver(locator.clone()).resolve(&[user("U1", "")]).await.unwrap();
        assert!(results.is_empty());
        assert!(locator.requests.lock().is_empty());
    }

    #[test]
    fn parses_partial_result_lists() {
        let parsed = parse_results(
            r#"{"results": [
                {"id": "U1", "lat": 1.5, "long": 2.5, "confidence": 70},
                {"id": "U2", "lat": "north"},
                {"id": "U3", "lat": 3, "long": 4, "confidence": 40}
            ]}"#,
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "U1");
        assert_eq!(parsed[1].lat, 3.0);
        assert!(parse_results("{}").unwrap().is_empty());
        assert!(parse_results("not json").is_err());
    }

    #[tokio::test]
    async fn chat_client_round_trip() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path("/v1/chat/completions"),
            ])
            .respond_with(json_encoded(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "{\"results\": [{\"id\": \"U1\", \"lat\": 51.5, \"long\": -0.12, \"confidence\": 88}]}"
                    }
                }]
            }))),
        );

        let locator = ChatCompletionsLocator::new(
            &server.url("/v1").to_string(),
            "gpt-4o-mini",
            SecretString::new("test-key".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let results = locator
            .locate(&[LocationQuery {
                id: "U1".into(),
                location: "London".into(),
            }])
            .await
            .unwrap();
        assert_eq!(results, vec![LocatedUser {
            id: "U1".into(),
            lat: 51.5,
            long: -0.12,
            confidence: 88.0,
        }]);
    }

    #[tokio::test]
    async fn chat_client_reports_rate_limits() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/v1/chat/completions"))
                .respond_with(status_code(429)),
        );
        let locator = ChatCompletionsLocator::new(
            &server.url("/v1").to_string(),
            "gpt-4o-mini",
            SecretString::new("test-key".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = locator
            .locate(&[LocationQuery {
                id: "U1".into(),
                location: "London".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited { retry_after: None, .. }));
    }
}
