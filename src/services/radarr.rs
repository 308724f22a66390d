//! Radarr v3 API client
//!
//! Implements [`LibraryBackend`] on top of the Radarr REST API. Authentication
//! is the `X-Api-Key` header.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::library::LibraryBackend;
use super::rate_limiter::RateLimitedClient;
use crate::config::AddOptions;
use crate::error::LibraryError;
use crate::types::{Availability, BoxOfficeEntry, ExternalId, LibraryItem, QualityProfile, RootFolder};

/// Values Radarr v3 accepts for `minimumAvailability`
const MINIMUM_AVAILABILITY_VALUES: [&str; 3] = ["announced", "inCinemas", "released"];

/// Movie as returned by `/api/v3/movie`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadarrMovie {
    pub id: i64,
    pub title: String,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub quality_profile_id: i64,
    #[serde(default)]
    pub has_file: bool,
    #[serde(default)]
    pub is_available: bool,
    pub status: Option<String>,
    pub root_folder_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<i64>,
}

impl From<RadarrMovie> for LibraryItem {
    fn from(movie: RadarrMovie) -> Self {
        LibraryItem {
            id: movie.id,
            title: movie.title,
            // Radarr reports 0 for titles it could not link to TMDB
            tmdb_id: movie.tmdb_id.filter(|id| *id > 0),
            imdb_id: movie.imdb_id.filter(|id| !id.is_empty()),
            quality_profile_id: movie.quality_profile_id,
            has_file: movie.has_file,
            is_available: movie.is_available,
            availability: movie.status.as_deref().and_then(parse_availability),
            root_folder: movie.root_folder_path,
            tags: movie.tags,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RadarrTag {
    id: i64,
    label: String,
}

fn parse_availability(status: &str) -> Option<Availability> {
    match status {
        "tba" => Some(Availability::Tba),
        "announced" => Some(Availability::Announced),
        "inCinemas" => Some(Availability::InCinemas),
        "released" => Some(Availability::Released),
        "deleted" => Some(Availability::Deleted),
        other => {
            debug!(status = %other, "Unknown Radarr movie status");
            None
        }
    }
}

/// Radarr API client
pub struct RadarrClient {
    client: RateLimitedClient,
    base_url: String,
    api_key: String,
}

impl RadarrClient {
    pub fn new(base_url: &str, api_key: String) -> reqwest::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::for_radarr()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .inner()
            .request(method, format!("{}/api/v3/{}", self.base_url, path))
            .header("X-Api-Key", &self.api_key)
    }

    async fn execute(&self, path: &str, request: RequestBuilder) -> Result<Response, LibraryError> {
        let response = self.client.send(request).await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                LibraryError::Connection(format!("{}: {}", self.base_url, e))
            } else {
                LibraryError::Api {
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 401 {
            return Err(LibraryError::Auth);
        }
        if status.as_u16() == 404 {
            return Err(LibraryError::NotFound(path.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if is_movie_exists_error(&body) {
            return Err(LibraryError::AlreadyExists(error_message(&body)));
        }
        Err(LibraryError::Api {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, LibraryError> {
        let response = self.execute(path, self.request(Method::GET, path).query(query)).await?;
        response.json().await.map_err(|e| LibraryError::Decode(e.to_string()))
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: &Value) -> Result<T, LibraryError> {
        let response = self.execute(path, self.request(method, path).json(body)).await?;
        response.json().await.map_err(|e| LibraryError::Decode(e.to_string()))
    }

    /// Look up a title in Radarr's metadata source by external id
    pub async fn lookup(&self, id: &ExternalId) -> Result<Option<Value>, LibraryError> {
        let term = id.to_string();
        let results: Vec<Value> = self.get_json("movie/lookup", &[("term", term.as_str())]).await?;
        Ok(results.into_iter().next())
    }

    /// Id of the tag called `label`, creating it if needed
    pub async fn ensure_tag(&self, label: &str) -> Result<i64, LibraryError> {
        let tags: Vec<RadarrTag> = self.get_json("tag", &[]).await?;
        if let Some(tag) = tags.iter().find(|t| t.label.eq_ignore_ascii_case(label)) {
            return Ok(tag.id);
        }

        let created: RadarrTag = self.send_json(Method::POST, "tag", &json!({ "label": label })).await?;
        info!(tag = %created.label, tag_id = created.id, "Created Radarr tag");
        Ok(created.id)
    }
}

#[async_trait]
impl LibraryBackend for RadarrClient {
    async fn list_all(&self) -> Result<Vec<LibraryItem>, LibraryError> {
        let movies: Vec<RadarrMovie> = self.get_json("movie", &[]).await?;
        debug!(count = movies.len(), "Fetched Radarr movie list");
        Ok(movies.into_iter().map(LibraryItem::from).collect())
    }

    async fn create(
        &self,
        entry: &BoxOfficeEntry,
        root_folder: &str,
        profile: &QualityProfile,
        options: &AddOptions,
    ) -> Result<LibraryItem, LibraryError> {
        let id = match (entry.ids.primary, entry.ids.secondary.as_ref()) {
            (Some(tmdb), _) => ExternalId::Tmdb(tmdb),
            (None, Some(imdb)) => ExternalId::Imdb(imdb.clone()),
            (None, None) => return Err(LibraryError::NotFound(format!("no external id for {}", entry.title))),
        };
        let lookup = self
            .lookup(&id)
            .await?
            .ok_or_else(|| LibraryError::NotFound(format!("movie lookup {}", id)))?;

        let tag_id = match options.tag.as_deref() {
            Some(label) => match self.ensure_tag(label).await {
                Ok(tag_id) => Some(tag_id),
                Err(e) => {
                    warn!(tag = %label, error = %e, "Auto-tagging skipped");
                    None
                }
            },
            None => None,
        };

        let payload = build_add_payload(lookup, root_folder, profile, options, tag_id);
        let movie: RadarrMovie = self.send_json(Method::POST, "movie", &payload).await?;
        Ok(movie.into())
    }

    async fn update_quality_profile(&self, item_id: i64, profile_id: i64) -> Result<(), LibraryError> {
        let path = format!("movie/{}", item_id);
        let mut movie: Value = self.get_json(&path, &[]).await?;
        movie["qualityProfileId"] = json!(profile_id);
        let _: Value = self.send_json(Method::PUT, &path, &movie).await?;
        Ok(())
    }

    async fn root_folders(&self) -> Result<Vec<RootFolder>, LibraryError> {
        self.get_json("rootfolder", &[]).await
    }

    async fn quality_profiles(&self) -> Result<Vec<QualityProfile>, LibraryError> {
        self.get_json("qualityprofile", &[]).await
    }
}

/// Turn a lookup result into the body of `POST /api/v3/movie`
pub fn build_add_payload(
    lookup: Value,
    root_folder: &str,
    profile: &QualityProfile,
    options: &AddOptions,
    tag_id: Option<i64>,
) -> Value {
    let mut movie = match lookup {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    movie.insert("qualityProfileId".into(), json!(profile.id));
    movie.insert("rootFolderPath".into(), json!(root_folder));
    movie.insert("monitored".into(), json!(options.monitored));
    movie.insert(
        "addOptions".into(),
        json!({
            "searchForMovie": options.search_on_add,
            "monitor": "movieOnly",
        }),
    );
    movie.insert("tags".into(), json!(tag_id.into_iter().collect::<Vec<_>>()));

    if let Some(value) = options.minimum_availability.as_deref() {
        let value = if MINIMUM_AVAILABILITY_VALUES.contains(&value) {
            value
        } else {
            warn!(value = %value, "Unsupported minimumAvailability, using 'announced'");
            "announced"
        };
        movie.insert("minimumAvailability".into(), json!(value));
    }

    Value::Object(movie)
}

/// Radarr answers a duplicate add with a 400 carrying `MovieExistsValidator`
fn is_movie_exists_error(body: &str) -> bool {
    body.contains("MovieExistsValidator") || body.contains("already been added")
}

/// Best human-readable message from a Radarr error body
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| match v {
        Value::Object(map) => map.get("message").and_then(Value::as_str).map(str::to_string),
        Value::Array(errors) => {
            let messages: Vec<String> = errors
                .iter()
                .take(3)
                .filter_map(|e| e.get("errorMessage").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    });
    from_json.unwrap_or_else(|| body.chars().take(300).collect())
}
