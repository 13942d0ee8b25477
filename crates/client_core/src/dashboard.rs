use std::sync::Arc;

use shared::{
    domain::NewsCategory,
    error::ApiError,
    protocol::{NewsArticle, NewsResponse, WeatherReport},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    session::{SessionEvent, SessionManager},
    transport::{self, ApiClient, RequestFailure},
};

/// Provider failures are folded into the slice's `Failed` state and logged;
/// this type never crosses the orchestrator boundary.
#[derive(Debug, Error)]
pub enum DataFetchError {
    #[error("service rejected the request: {0}")]
    Rejected(ApiError),
    #[error("request failed: {0}")]
    Transport(String),
}

impl From<RequestFailure> for DataFetchError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Rejected(api_error) => DataFetchError::Rejected(api_error),
            RequestFailure::Transport(message) => DataFetchError::Transport(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed,
}

/// Weather for the profile city. The report is replaced wholesale on every
/// fetch and absent while loading or after a failure; `Failed` carries no
/// extra detail for the view to render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherSlice {
    pub state: SliceState,
    pub report: Option<WeatherReport>,
}

/// Headlines for the selected category. The category survives refreshes and
/// sign-in, and only changes through an explicit switch or a reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewsSlice {
    pub state: SliceState,
    pub category: NewsCategory,
    pub articles: Vec<NewsArticle>,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub enum DashboardEvent {
    WeatherChanged(WeatherSlice),
    NewsChanged(NewsSlice),
}

#[derive(Default)]
struct DashboardState {
    weather: WeatherSlice,
    news: NewsSlice,
    // Generation counters invalidate in-flight fetches: a completion only
    // commits if the counter it started under is still current.
    weather_generation: u64,
    news_generation: u64,
}

/// Drives the two dashboard data slices for the signed-in user. Fetches are
/// independent and may overlap; every committed slice change is broadcast so
/// a presentation layer can re-render.
pub struct DashboardOrchestrator {
    api: ApiClient,
    inner: Mutex<DashboardState>,
    events: broadcast::Sender<DashboardEvent>,
}

impl DashboardOrchestrator {
    pub fn new(api: ApiClient) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            api,
            inner: Mutex::new(DashboardState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    pub async fn weather(&self) -> WeatherSlice {
        self.inner.lock().await.weather.clone()
    }

    pub async fn news(&self) -> NewsSlice {
        self.inner.lock().await.news.clone()
    }

    pub async fn current_category(&self) -> NewsCategory {
        self.inner.lock().await.news.category
    }

    /// Subscribes to session transitions: sign-in fires both fetches once,
    /// a profile update that changed the city re-fires weather, sign-out
    /// resets the dashboard.
    pub fn attach(self: &Arc<Self>, session: &SessionManager) -> JoinHandle<()> {
        let mut events = session.subscribe();
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::SignedIn(_)) => {
                        tokio::join!(orchestrator.fetch_weather(), orchestrator.refresh_news());
                    }
                    Ok(SessionEvent::ProfileUpdated { city_changed, .. }) => {
                        if city_changed {
                            orchestrator.fetch_weather().await;
                        }
                    }
                    Ok(SessionEvent::SignedOut) => orchestrator.reset().await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dashboard fell behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fetches weather for the session's profile city; the server resolves
    /// the city, the client sends no parameter.
    pub async fn fetch_weather(&self) {
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.weather_generation += 1;
            inner.weather.state = SliceState::Loading;
            let _ = self
                .events
                .send(DashboardEvent::WeatherChanged(inner.weather.clone()));
            inner.weather_generation
        };

        let outcome = self.request_weather().await;

        let mut inner = self.inner.lock().await;
        if inner.weather_generation != generation {
            debug!("discarding stale weather response");
            return;
        }
        inner.weather = match outcome {
            Ok(report) => WeatherSlice {
                state: SliceState::Loaded,
                report: Some(report),
            },
            Err(err) => {
                warn!("weather fetch failed: {err}");
                WeatherSlice {
                    state: SliceState::Failed,
                    report: None,
                }
            }
        };
        let _ = self
            .events
            .send(DashboardEvent::WeatherChanged(inner.weather.clone()));
    }

    /// Switches the news category and fetches it. The category takes effect
    /// immediately, whatever the fetch outcome.
    pub async fn switch_category(&self, category: NewsCategory) {
        self.fetch_news(Some(category)).await;
    }

    /// Re-fetches headlines for the current category.
    pub async fn refresh_news(&self) {
        self.fetch_news(None).await;
    }

    async fn fetch_news(&self, category: Option<NewsCategory>) {
        let (generation, category) = {
            let mut inner = self.inner.lock().await;
            if let Some(category) = category {
                inner.news.category = category;
            }
            inner.news_generation += 1;
            inner.news.state = SliceState::Loading;
            let _ = self
                .events
                .send(DashboardEvent::NewsChanged(inner.news.clone()));
            (inner.news_generation, inner.news.category)
        };

        let outcome = self.request_news(category).await;

        let mut inner = self.inner.lock().await;
        if inner.news_generation != generation {
            debug!(category = %category, "discarding stale news response");
            return;
        }
        inner.news = match outcome {
            Ok(response) => NewsSlice {
                state: SliceState::Loaded,
                category,
                articles: response.news,
                from_cache: response.from_cache,
            },
            Err(err) => {
                warn!(category = %category, "news fetch failed: {err}");
                NewsSlice {
                    state: SliceState::Failed,
                    category,
                    articles: Vec::new(),
                    from_cache: false,
                }
            }
        };
        let _ = self
            .events
            .send(DashboardEvent::NewsChanged(inner.news.clone()));
    }

    /// Returns both slices to their pre-sign-in shape and invalidates every
    /// in-flight fetch, so nothing started before a sign-out can commit.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.weather_generation += 1;
        inner.news_generation += 1;
        inner.weather = WeatherSlice::default();
        inner.news = NewsSlice::default();
        let _ = self
            .events
            .send(DashboardEvent::WeatherChanged(inner.weather.clone()));
        let _ = self
            .events
            .send(DashboardEvent::NewsChanged(inner.news.clone()));
    }

    async fn request_weather(&self) -> Result<WeatherReport, DataFetchError> {
        let request = self.api.bearer_get("dashboard/weather/").await?;
        let response = request
            .send()
            .await
            .map_err(|err| DataFetchError::Transport(err.to_string()))?;
        Ok(transport::decode_json(response).await?)
    }

    async fn request_news(&self, category: NewsCategory) -> Result<NewsResponse, DataFetchError> {
        let request = self.api.bearer_get("dashboard/news/").await?;
        let response = request
            .query(&[("category", category.as_str())])
            .send()
            .await
            .map_err(|err| DataFetchError::Transport(err.to_string()))?;
        Ok(transport::decode_json(response).await?)
    }
}

#[cfg(test)]
#[path = "tests/dashboard_tests.rs"]
mod tests;
